//! # services
//!
//! Business rules of the comment engine. Everything in here talks to the outside
//! world through the ports defined in `domains`.

pub mod comments;
pub mod formatter;
pub mod notify;
pub mod restricted;
pub mod search;
pub mod streamer;
pub mod tree;
pub mod utils;

pub use comments::{DataService, DataServiceConfig, EditRequest};
pub use formatter::{CommentConverter, CommentFormatter, ConverterFn};
pub use notify::{NotifyService, NotifyStats};
pub use restricted::RestrictedWords;
pub use search::{SearchResults, SearchService};
pub use streamer::{StreamSlot, Streamer};
pub use tree::{Node, Tree};
