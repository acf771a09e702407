pub mod internal;
pub mod script;
pub mod track;
