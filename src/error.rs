use thiserror::Error;

/// One entry of the disassembly window shown around a fault in a structured diagnostic.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub source_name: String,
    pub ip: usize,
    pub opcode: String,
}

/// Everything the interpreter needed to know at the moment an unhandled error reached
/// the outermost interpret call: enough to reproduce §7's diagnostic without re-walking
/// a torn-down call stack.
#[derive(Debug, Clone, Default)]
pub struct Diagnostic {
    pub frames: Vec<TraceFrame>,
    pub window: Vec<String>,
    pub stack_tail: Vec<String>,
    pub open_upvalues: usize,
    pub active_handlers: usize,
}

/// Errors raised while executing a loaded program.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("dispatch error: {op} undefined for ({lhs}, {rhs})")]
    Dispatch { op: String, lhs: String, rhs: String },

    #[error("bounds error: {what}")]
    Bounds { what: String },

    #[error("type error: {what}")]
    Type { what: String },

    #[error("import error: {what}")]
    Import { what: String },

    #[error("{message}")]
    User { message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    pub fn bounds(what: impl Into<String>) -> Self {
        VmError::Bounds { what: what.into() }
    }

    pub fn type_error(what: impl Into<String>) -> Self {
        VmError::Type { what: what.into() }
    }

    pub fn dispatch(op: impl Into<String>, lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        VmError::Dispatch { op: op.into(), lhs: lhs.into(), rhs: rhs.into() }
    }

    pub fn import(what: impl Into<String>) -> Self {
        VmError::Import { what: what.into() }
    }
}

/// Errors raised while parsing a textual or binary module before a VM frame exists.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot open '{path}': {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("{source_name}:{line}: {message}")]
    Syntax { source_name: String, line: usize, message: String },

    #[error("{source_name}: unresolved label '{label}' in function '{func}'")]
    UnresolvedLabel { source_name: String, func: String, label: String },

    #[error("{source_name}: function '{func}' is missing required directive: {what}")]
    MissingDirective { source_name: String, func: String, what: String },

    #[error("{source_name}: no prototype named '@main'")]
    MissingMain { source_name: String },

    #[error("{source_name}: malformed binary module: {what}")]
    Binary { source_name: String, what: String },

    #[error("{source_name}: unknown directive '{directive}'")]
    UnknownDirective { source_name: String, directive: String },
}
