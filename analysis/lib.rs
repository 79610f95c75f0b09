#![deny(dead_code)]
#![deny(unused_imports)]

pub mod analysis;
pub mod design;
pub mod engine;
pub mod entities;
pub mod first_level;
pub mod images;
pub mod layout;
pub mod model;
pub mod second_level;
pub mod ttest;
