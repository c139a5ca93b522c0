pub mod data;
pub mod form;
pub mod http;
pub mod util;
