//! Line-oriented `KEY=VALUE` files consumed by the container tool.
//!
//! Keys and values are written verbatim, so any newline, carriage return or
//! null byte would let a value smuggle extra lines into the file. Those are
//! rejected before anything is written.

use std::path::Path;

use crate::error::{Error, Result};

fn check(kind: &'static str, key: &str, text: &str) -> Result<()> {
    if text.contains(['\n', '\r', '\0']) {
        return Err(Error::InvalidEnvEntry {
            kind,
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Renders entries as `KEY=VALUE` lines in the given order.
pub fn render<'a, I>(entries: I) -> Result<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (key, value) in entries {
        check("key", key, key)?;
        check("value", key, value)?;
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

/// Validates and writes entries to `path`. Nothing is written on error.
pub fn write<'a, I>(path: &Path, entries: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let content = render(entries)?;
    std::fs::write(path, content)?;
    Ok(())
}
