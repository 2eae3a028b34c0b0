pub mod sys;
pub mod parsing;

pub mod contextualize;
pub mod core;
pub mod model;
pub mod observer;
