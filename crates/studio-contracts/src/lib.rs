pub mod artifact;
pub mod chat;
pub mod events;
pub mod gallery;
pub mod history;
pub mod prompt;
pub mod selection;
