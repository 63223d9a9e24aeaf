pub mod key_encoding;
pub mod node;
pub mod primary;
pub mod secondary;
pub mod tree;
