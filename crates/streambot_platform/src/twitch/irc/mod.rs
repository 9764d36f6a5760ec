#![forbid(unsafe_code)]

pub mod connection;
pub mod parser;


pub use connection::{ChatConfig, ChatConnection, DEFAULT_IRC_WS_URL, format_privmsg};
pub use parser::{IrcLine, parse_event, parse_line};
