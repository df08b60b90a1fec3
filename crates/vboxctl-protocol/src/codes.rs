//! Result codes carried in faults and progress objects.
//!
//! Values follow the platform's HRESULT numbering so they can be compared
//! against platform documentation directly.

/// Success.
pub const S_OK: u32 = 0;

/// Unspecified failure.
pub const E_FAIL: u32 = 0x8000_4005;

/// Invalid argument.
pub const E_INVALIDARG: u32 = 0x8007_0057;

/// Access denied (bad credentials on logon).
pub const E_ACCESSDENIED: u32 = 0x8007_0005;

/// Stale, released or foreign object reference.
pub const E_POINTER: u32 = 0x8000_4003;

/// Object not found.
pub const VBOX_E_OBJECT_NOT_FOUND: u32 = 0x80BB_0001;

/// Operation not allowed in the current machine state.
pub const VBOX_E_INVALID_VM_STATE: u32 = 0x80BB_0002;

/// Operation not allowed in the current object state.
pub const VBOX_E_INVALID_OBJECT_STATE: u32 = 0x80BB_0007;

/// Operation not allowed in the current session state.
pub const VBOX_E_INVALID_SESSION_STATE: u32 = 0x80BB_000B;

/// Symbolic name of a result code, if known.
pub fn name(code: u32) -> Option<&'static str> {
    match code {
        S_OK => Some("S_OK"),
        E_FAIL => Some("E_FAIL"),
        E_INVALIDARG => Some("E_INVALIDARG"),
        E_ACCESSDENIED => Some("E_ACCESSDENIED"),
        E_POINTER => Some("E_POINTER"),
        VBOX_E_OBJECT_NOT_FOUND => Some("VBOX_E_OBJECT_NOT_FOUND"),
        VBOX_E_INVALID_VM_STATE => Some("VBOX_E_INVALID_VM_STATE"),
        VBOX_E_INVALID_OBJECT_STATE => Some("VBOX_E_INVALID_OBJECT_STATE"),
        VBOX_E_INVALID_SESSION_STATE => Some("VBOX_E_INVALID_SESSION_STATE"),
        _ => None,
    }
}

/// Render a result code as `0x80bb0001 (VBOX_E_OBJECT_NOT_FOUND)`.
pub fn describe(code: u32) -> String {
    match name(code) {
        Some(n) => format!("{:#010x} ({})", code, n),
        None => format!("{:#010x}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(describe(VBOX_E_OBJECT_NOT_FOUND), "0x80bb0001 (VBOX_E_OBJECT_NOT_FOUND)");
        assert_eq!(describe(0x1234), "0x00001234");
    }
}
