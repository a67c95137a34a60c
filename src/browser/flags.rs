use anyhow::{bail, Result};

/// Translates a task flag string into a (name, value) pair. A leading `--`
/// is stripped; the first `=` splits name from value; a flag without `=` is
/// a bare switch. An empty name is invalid.
pub fn format_flag(flag: &str) -> Result<(String, Option<String>)> {
    let flag = flag.strip_prefix("--").unwrap_or(flag);

    let (name, value) = match flag.split_once('=') {
        Some((name, value)) => (name, Some(value.to_string())),
        None => (flag, None),
    };

    if name.is_empty() {
        bail!("invalid flag: {flag}");
    }

    Ok((name.to_string(), value))
}

/// Renders a (name, value) pair back into the single-argument form the
/// browser binary expects.
pub fn render_flag(name: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("--{name}={value}"),
        None => format!("--{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_switch_has_no_value() {
        assert_eq!(format_flag("--incognito").unwrap(), ("incognito".into(), None));
        assert_eq!(format_flag("incognito").unwrap(), ("incognito".into(), None));
    }

    #[test]
    fn value_flag_splits_on_first_equals() {
        assert_eq!(
            format_flag("--disk-cache-size=0").unwrap(),
            ("disk-cache-size".into(), Some("0".into()))
        );
        assert_eq!(
            format_flag("--disable-features=IsolateOrigins,site-per-process").unwrap(),
            (
                "disable-features".into(),
                Some("IsolateOrigins,site-per-process".into())
            )
        );
        // Only the first '=' splits; the rest belongs to the value.
        assert_eq!(
            format_flag("--foo=a=b").unwrap(),
            ("foo".into(), Some("a=b".into()))
        );
    }

    #[test]
    fn empty_name_is_invalid() {
        assert!(format_flag("--").is_err());
        assert!(format_flag("--=value").is_err());
    }

    #[test]
    fn render_round_trips() {
        for raw in ["--incognito", "--disk-cache-size=0"] {
            let (name, value) = format_flag(raw).unwrap();
            assert_eq!(render_flag(&name, value.as_deref()), raw);
        }
    }
}
