pub mod core;
pub mod directory;
pub mod enrollments;
pub mod feedback;
pub mod lessons;
pub mod reminders;
