//! Session configuration

use std::ffi::CString;

/// Options for creating a [`Session`](crate::Session)
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Open the runtime's standard libraries
    pub open_stdlib: bool,

    /// Name reported for snippets run with `execute` (`=name` shows verbatim)
    pub chunk_name: String,

    /// Label used in logs (None = derived from the session id)
    pub label: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            open_stdlib: true,
            chunk_name: "=lunabridge".to_string(),
            label: None,
        }
    }
}

impl SessionOptions {
    /// Options for a runtime without the standard libraries
    pub fn bare() -> Self {
        Self {
            open_stdlib: false,
            ..Default::default()
        }
    }

    /// Set the chunk name used by `execute`
    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Set the log label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn chunk_name_cstr(&self) -> CString {
        CString::new(self.chunk_name.replace('\0', "")).unwrap_or_default()
    }
}
