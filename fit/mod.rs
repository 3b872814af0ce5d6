pub mod basis;
pub mod construction;
pub mod data;
pub mod estimate;
pub mod model;
