pub mod experiment;
pub mod training;
