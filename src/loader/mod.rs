//! Readers that turn a `.meow` (textual) or `.meowb` (binary) source file into
//! a set of linked [`crate::objects::proto::FunctionProto`] objects on the
//! heap, keyed by name (§6). Both formats describe the exact same prototype
//! shape; they differ only in how bytes on disk map to it.

pub mod binary;
pub mod text;

use std::collections::HashMap;

use crate::objects::Header;

/// What a parsed constant slot resolves to once every prototype in the file
/// has been allocated: either a plain value already known at parse time, or a
/// forward reference to another prototype in the same file (`@name`),
/// resolved by the final linking pass.
pub(crate) enum ConstSlot {
    Value(crate::value::Value),
    ProtoRef(String),
}

pub(crate) type ProtoMap = HashMap<String, *mut Header>;
