pub mod media;
pub mod resource;
pub mod scan;
pub mod setup;
pub mod sources;
