//! Input validation for arguments, code bodies, and coordination keys.
//!
//! Every string that is about to become a subprocess argument, a sandbox
//! payload, or a coordination-store key passes through this module before it
//! touches shared state. Validation is pure and synchronous: no allocation
//! beyond error construction, no I/O, no hidden state. A string rejected once
//! is rejected forever, and an accepted string is returned to the caller
//! byte-for-byte unchanged.
//!
//! Checks run in a fixed order and fail on the first violation:
//!
//! 1. Shape — non-empty where emptiness is meaningless (keys).
//! 2. Length ceiling — [`MAX_ARG_LENGTH`] for arguments, [`MAX_CODE_LENGTH`]
//!    for code bodies, [`MAX_KEY_LENGTH`] for keys.
//! 3. Byte denylist — NUL and control bytes, shell metacharacters, path
//!    traversal sequences, script- and SQL-injection fragments.
//! 4. Numeric range — bounded quantities (timeouts, worker counts, limits)
//!    are checked against named bounds.
//! 5. Cross-argument conflicts — mutually exclusive flags present together.
//!
//! Validation errors are never retried by the recovery layer: they indicate a
//! caller bug or an attack, not a transient failure.

use thiserror::Error;

/// Maximum length in bytes for a single subprocess argument.
pub const MAX_ARG_LENGTH: usize = 2000;

/// Maximum length in bytes for a sandbox code body.
pub const MAX_CODE_LENGTH: usize = 256 * 1024;

/// Maximum length in bytes for a coordination-store key.
pub const MAX_KEY_LENGTH: usize = 512;

/// Shell metacharacters that allow command chaining or substitution.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']'];

/// Substrings that indicate path traversal attempts.
const TRAVERSAL_SEQUENCES: &[&str] = &["../", "..\\"];

/// Substrings that indicate script injection into interpreted sinks.
const SCRIPT_INJECTION_MARKERS: &[&str] = &["<script", "javascript:", "data:text/html"];

/// Case-insensitive SQL fragments that have no business in an argument.
const SQL_INJECTION_FRAGMENTS: &[&str] = &[
    "' or '",
    "\" or \"",
    "union select",
    "drop table",
    "; --",
];

/// Errors raised by validation. Each variant names the offending input so the
/// caller can report exactly what was rejected and why.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Input exceeds the applicable length ceiling.
    #[error("argument {index} exceeds maximum length: {length} > {max} bytes")]
    TooLong {
        /// Index of the offending argument (0 for single-input checks).
        index: usize,
        /// Actual length in bytes.
        length: usize,
        /// The violated ceiling.
        max: usize,
    },

    /// Input contains a NUL or other control byte.
    #[error("argument {index} contains control byte 0x{byte:02x}")]
    ControlByte {
        /// Index of the offending argument.
        index: usize,
        /// The rejected byte.
        byte: u8,
    },

    /// Input contains a shell metacharacter.
    #[error("argument {index} contains shell metacharacter {character:?}")]
    ShellMetacharacter {
        /// Index of the offending argument.
        index: usize,
        /// The rejected character.
        character: char,
    },

    /// Input contains a path traversal sequence.
    #[error("argument {index} contains path traversal sequence {snippet:?}")]
    PathTraversal {
        /// Index of the offending argument.
        index: usize,
        /// The matched sequence.
        snippet: String,
    },

    /// Input matches a known injection pattern.
    #[error("argument {index} matches injection pattern {snippet:?}")]
    InjectionPattern {
        /// Index of the offending argument.
        index: usize,
        /// The matched fragment.
        snippet: String,
    },

    /// A bounded numeric quantity is out of range.
    #[error("{name} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// Name of the bounded quantity.
        name: String,
        /// The rejected value.
        value: i64,
        /// Lower bound, inclusive.
        min: i64,
        /// Upper bound, inclusive.
        max: i64,
    },

    /// Two mutually exclusive flags are present together.
    #[error("conflicting arguments: {first:?} and {second:?} are mutually exclusive")]
    ConflictingArguments {
        /// The first flag.
        first: String,
        /// The second flag.
        second: String,
    },

    /// A coordination key is empty or uses a forbidden character.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key (truncated for display).
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Validates a slice of subprocess arguments.
///
/// # Errors
///
/// Returns the first violation found, carrying the offending index. No
/// partial result is produced: either every argument passes or the whole
/// slice is rejected.
pub fn validate_args<S: AsRef<str>>(args: &[S]) -> Result<(), ValidationError> {
    for (index, arg) in args.iter().enumerate() {
        validate_arg_at(index, arg.as_ref())?;
    }
    Ok(())
}

fn validate_arg_at(index: usize, arg: &str) -> Result<(), ValidationError> {
    if arg.len() > MAX_ARG_LENGTH {
        return Err(ValidationError::TooLong {
            index,
            length: arg.len(),
            max: MAX_ARG_LENGTH,
        });
    }

    for &byte in arg.as_bytes() {
        if byte == 0 || (byte < 0x20 && byte != b'\t') {
            return Err(ValidationError::ControlByte { index, byte });
        }
    }

    if let Some(character) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ValidationError::ShellMetacharacter { index, character });
    }

    for sequence in TRAVERSAL_SEQUENCES {
        if arg.contains(sequence) {
            return Err(ValidationError::PathTraversal {
                index,
                snippet: (*sequence).to_string(),
            });
        }
    }

    let lowered = arg.to_ascii_lowercase();
    for marker in SCRIPT_INJECTION_MARKERS {
        if lowered.contains(marker) {
            return Err(ValidationError::InjectionPattern {
                index,
                snippet: (*marker).to_string(),
            });
        }
    }
    for fragment in SQL_INJECTION_FRAGMENTS {
        if lowered.contains(fragment) {
            return Err(ValidationError::InjectionPattern {
                index,
                snippet: (*fragment).to_string(),
            });
        }
    }

    Ok(())
}

/// Validates a sandbox code body.
///
/// Code bodies get a larger ceiling than arguments and are checked only for
/// size and embedded NUL bytes: the sandbox tiers, not string filtering, are
/// the containment boundary for code semantics.
///
/// # Errors
///
/// Returns `TooLong` or `ControlByte` on violation.
pub fn validate_code(code: &[u8]) -> Result<(), ValidationError> {
    if code.len() > MAX_CODE_LENGTH {
        return Err(ValidationError::TooLong {
            index: 0,
            length: code.len(),
            max: MAX_CODE_LENGTH,
        });
    }
    if let Some(position) = code.iter().position(|&b| b == 0) {
        // Binary wasm payloads legitimately contain NUL; only text payloads
        // are NUL-checked. Wasm magic is `\0asm`.
        if !code.starts_with(b"\0asm") {
            return Err(ValidationError::ControlByte {
                index: position,
                byte: 0,
            });
        }
    }
    Ok(())
}

/// Validates a coordination-store key.
///
/// Keys are restricted to a conservative charset (ASCII alphanumerics plus
/// `-`, `_`, `.`, `:` and `/`) so that every backend can store them verbatim
/// and no key can smuggle traversal or separator bytes into a backend query.
///
/// # Errors
///
/// Returns `InvalidKey` naming the reason, or `TooLong` above
/// [`MAX_KEY_LENGTH`].
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::InvalidKey {
            key: String::new(),
            reason: "key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ValidationError::TooLong {
            index: 0,
            length: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    if key.contains("../") || key.contains("..\\") {
        return Err(ValidationError::InvalidKey {
            key: display_key(key),
            reason: "key must not contain traversal sequences".to_string(),
        });
    }
    if let Some(character) = key
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.' | ':' | '/'))
    {
        return Err(ValidationError::InvalidKey {
            key: display_key(key),
            reason: format!("forbidden character {character:?}"),
        });
    }
    Ok(())
}

/// Checks a bounded numeric quantity against named inclusive bounds.
///
/// # Errors
///
/// Returns `OutOfRange` naming the violated bound.
pub fn validate_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Detects mutually exclusive flags present in the same argument list.
///
/// `conflicts` pairs are matched against exact argument values, so callers
/// pass flags in their literal spelling (`"--exclusive"`, `"--shared"`).
///
/// # Errors
///
/// Returns `ConflictingArguments` for the first conflicting pair found.
pub fn validate_no_conflicts<S: AsRef<str>>(
    args: &[S],
    conflicts: &[(&str, &str)],
) -> Result<(), ValidationError> {
    for (first, second) in conflicts {
        let has_first = args.iter().any(|a| a.as_ref() == *first);
        let has_second = args.iter().any(|a| a.as_ref() == *second);
        if has_first && has_second {
            return Err(ValidationError::ConflictingArguments {
                first: (*first).to_string(),
                second: (*second).to_string(),
            });
        }
    }
    Ok(())
}

/// Truncates a key for inclusion in an error message.
fn display_key(key: &str) -> String {
    const DISPLAY_LIMIT: usize = 64;
    if key.len() <= DISPLAY_LIMIT {
        key.to_string()
    } else {
        let mut end = DISPLAY_LIMIT;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &key[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_arguments() {
        let args = ["--path=src/app", "--jobs=4", "run"];
        assert!(validate_args(&args).is_ok());
    }

    #[test]
    fn rejects_path_traversal_with_classification() {
        let result = validate_args(&["--path=../../etc/passwd"]);
        assert!(matches!(
            result,
            Err(ValidationError::PathTraversal { index: 0, .. })
        ));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in ["a;b", "a|b", "a`b", "a$b", "a(b", "a{b", "a[b"] {
            let result = validate_args(&[bad]);
            assert!(
                matches!(result, Err(ValidationError::ShellMetacharacter { .. })),
                "expected rejection for {bad:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn rejects_control_bytes() {
        assert!(matches!(
            validate_args(&["a\0b"]),
            Err(ValidationError::ControlByte { byte: 0, .. })
        ));
        assert!(matches!(
            validate_args(&["a\x1bb"]),
            Err(ValidationError::ControlByte { byte: 0x1b, .. })
        ));
        // Tab is permitted; it is common in argument payloads.
        assert!(validate_args(&["a\tb"]).is_ok());
    }

    #[test]
    fn rejects_sql_fragments_case_insensitively() {
        let result = validate_args(&["x UNION SELECT password"]);
        assert!(matches!(
            result,
            Err(ValidationError::InjectionPattern { .. })
        ));
    }

    #[test]
    fn rejects_overlong_argument_naming_index() {
        let long = "x".repeat(MAX_ARG_LENGTH + 1);
        let result = validate_args(&["ok", long.as_str()]);
        assert_eq!(
            result,
            Err(ValidationError::TooLong {
                index: 1,
                length: MAX_ARG_LENGTH + 1,
                max: MAX_ARG_LENGTH,
            })
        );
    }

    #[test]
    fn validation_is_pure_and_non_mutating() {
        let arg = "--path=src/app".to_string();
        let before = arg.clone();
        validate_args(std::slice::from_ref(&arg)).unwrap();
        assert_eq!(arg, before);

        // A rejected string is rejected again on re-validation.
        let bad = "--path=../../etc/passwd";
        assert!(validate_args(&[bad]).is_err());
        assert!(validate_args(&[bad]).is_err());
    }

    #[test]
    fn code_ceiling_is_larger_than_arg_ceiling() {
        let code = vec![b'x'; MAX_ARG_LENGTH + 1];
        assert!(validate_code(&code).is_ok());

        let oversized = vec![b'x'; MAX_CODE_LENGTH + 1];
        assert!(matches!(
            validate_code(&oversized),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn code_allows_wasm_binaries_but_not_nul_in_text() {
        let wasm = b"\0asm\x01\0\0\0".to_vec();
        assert!(validate_code(&wasm).is_ok());

        let text = b"print\0ln".to_vec();
        assert!(matches!(
            validate_code(&text),
            Err(ValidationError::ControlByte { byte: 0, .. })
        ));
    }

    #[test]
    fn key_charset_is_enforced() {
        assert!(validate_key("warden:lock:file-X").is_ok());
        assert!(validate_key("a/b.c_d-e:f").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("bad key").is_err());
        assert!(validate_key("key;drop").is_err());
        assert!(validate_key("../escape").is_err());
    }

    #[test]
    fn range_check_names_the_bound() {
        let err = validate_range("timeout_ms", 0, 1, 600_000).unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                name: "timeout_ms".to_string(),
                value: 0,
                min: 1,
                max: 600_000,
            }
        );
        assert!(validate_range("timeout_ms", 5000, 1, 600_000).is_ok());
    }

    #[test]
    fn conflict_detection_matches_literal_flags() {
        let args = ["--exclusive", "--shared"];
        let result = validate_no_conflicts(&args, &[("--exclusive", "--shared")]);
        assert!(matches!(
            result,
            Err(ValidationError::ConflictingArguments { .. })
        ));

        let args = ["--exclusive"];
        assert!(validate_no_conflicts(&args, &[("--exclusive", "--shared")]).is_ok());
    }
}
