pub mod element;
pub mod jid;
pub mod stanza;

pub use element::*;
pub use jid::*;
pub use stanza::*;
