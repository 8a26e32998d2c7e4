pub mod backup;
pub mod classes;
pub mod core;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
pub mod subjects;
