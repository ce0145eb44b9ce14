pub mod atomic;
pub mod logbook;
