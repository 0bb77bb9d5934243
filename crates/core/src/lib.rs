//! Domain layer shared by the capture service and the page runtime: field
//! validators, form sessions, page events and lead normalization.

pub mod events;
pub mod form;
pub mod lead;
pub mod validator;
