//! Interned call-site identities.

use std::collections::HashSet;
use std::sync::Arc;

/// One frame of a captured stack, as delivered by the snapshot source.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StackFrame {
    /// Fully qualified type or module name.
    pub class_name: String,
    /// Method or function name.
    pub method_name: String,
    /// Line number of the call site, zero when unknown.
    pub line_number: u32,
}

impl StackFrame {
    /// Creates a frame.
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>, line_number: u32) -> Self {
        StackFrame {
            class_name: class_name.into(),
            method_name: method_name.into(),
            line_number,
        }
    }
}

/// A deduplicated call-site identity. Equal frames across all samples of a
/// session share one allocation, so tree keys compare cheaply and the
/// report references each call site once.
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProfiledMethod {
    /// Fully qualified type or module name.
    pub class_name: String,
    /// Method or function name.
    pub method_name: String,
    /// Line number of the call site.
    pub line_number: u32,
}

impl From<&StackFrame> for ProfiledMethod {
    fn from(frame: &StackFrame) -> Self {
        ProfiledMethod {
            class_name: frame.class_name.clone(),
            method_name: frame.method_name.clone(),
            line_number: frame.line_number,
        }
    }
}

/// Interns [`ProfiledMethod`]s for one profiling session.
///
/// Owned by the aggregator and dropped with the session, so the intern
/// table never outlives the data referencing it.
#[derive(Debug, Default)]
pub struct MethodInterner {
    methods: HashSet<Arc<ProfiledMethod>>,
}

impl MethodInterner {
    /// Creates an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared identity for a frame, allocating it on first
    /// sight.
    pub fn intern(&mut self, frame: &StackFrame) -> Arc<ProfiledMethod> {
        let method = ProfiledMethod::from(frame);
        if let Some(existing) = self.methods.get(&method) {
            return Arc::clone(existing);
        }
        let method = Arc::new(method);
        self.methods.insert(Arc::clone(&method));
        method
    }

    /// Number of distinct call sites seen so far.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no call site was interned yet.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
