// ABOUTME: Identifier validation, quoting, and log-safe URL helpers
// ABOUTME: Shared by the MySQL reader and the warehouse SQL builders

use crate::error::{Result, SyncError};

/// Maximum identifier length accepted by the warehouse (PostgreSQL NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a table or column identifier
///
/// Identifiers are interpolated into SQL on both the source and the
/// destination, so they must:
/// - Be 1-63 characters long
/// - Start with a letter (a-z, A-Z) or underscore (_)
/// - Contain only letters, digits (0-9), underscores, or `$`
///
/// # Errors
///
/// Returns [`SyncError::Config`] describing the first violation found.
///
/// # Examples
///
/// ```
/// # use warehouse_replicator::utils::validate_identifier;
/// assert!(validate_identifier("orders").is_ok());
/// assert!(validate_identifier("_staging_1").is_ok());
/// assert!(validate_identifier("123orders").is_err());
/// assert!(validate_identifier("orders\"; DROP TABLE x; --").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config(
            "Identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    if trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(SyncError::Config(format!(
            "Identifier '{}' exceeds maximum length of {} characters (got {})",
            sanitize_identifier(trimmed),
            MAX_IDENTIFIER_LEN,
            trimmed.len()
        )));
    }

    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(SyncError::Config(format!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            )));
        }
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '$' {
            return Err(SyncError::Config(format!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, underscores, and '$' are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            )));
        }
    }

    Ok(())
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length to prevent log injection.
/// This is for display only; SQL safety comes from [`validate_identifier`]
/// plus quoting.
///
/// ```
/// # use warehouse_replicator::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// assert_eq!(sanitize_identifier(&"a".repeat(200)).len(), 100);
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier (schema, table, column)
///
/// Escapes embedded quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a MySQL identifier (table, column)
///
/// MySQL uses backticks for identifier quoting. Embedded backticks are doubled.
///
/// ```
/// use warehouse_replicator::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("users"), "`users`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Mask the password component of a connection URL for logging.
///
/// Strings that do not parse as URLs are returned unchanged.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}
