//! Route expression grammar for Rapport flows.
//!
//! A route names either a single state (`register`) or a directed edge between
//! two states (`register --> contact`). Edges may carry trigger labels inside
//! brackets (`register --[ ok, retry ]--> contact`). The arrow pieces are
//! configurable through [`ArrowStyle`].
//!
//! # Example
//! ```
//! use rapport_route::{parse_route, ArrowStyle, Route};
//!
//! let style = ArrowStyle::default();
//! let route = parse_route("register --> contact", &style).unwrap();
//! assert_eq!(route, Route::edge("register", "contact"));
//! assert_eq!(route.render(&style), "register --> contact");
//! ```

pub mod ast;
mod parser;

pub use ast::*;
pub use parser::parse_route;
