pub mod backup;
pub mod calendar;
pub mod classes;
pub mod core;
pub mod grades;
pub mod professors;
pub mod students;
pub mod sync;
