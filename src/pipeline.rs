pub mod clustering;
pub mod similarity;
pub mod tags;
pub mod tokenize;
