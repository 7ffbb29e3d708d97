//! Kernel command line editing.
//!
//! A command line is kept as an ordered list of parameters, so that removing
//! or replacing a parameter preserves the relative order of all others.
//! Parameters are split on unquoted whitespace, and parsed as either
//! key-only switches or key=value pairs.

/// The kernel argument naming the root device.
pub const ROOT: &str = "root";
/// The kernel argument carrying the dm-verity root hash.
pub const ROOTHASH: &str = "roothash";

/// A kernel command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline(Vec<String>);

impl From<&str> for Cmdline {
    fn from(input: &str) -> Self {
        let mut in_quotes = false;
        let params = input
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Self(params)
    }
}

impl std::fmt::Display for Cmdline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl Cmdline {
    /// Remove every argument with the given key name, returning how many
    /// were removed.
    pub fn remove_all(&mut self, key: &str) -> usize {
        let key = ParameterKey(key);
        let before = self.0.len();
        self.0.retain(|p| Parameter::from(p.as_str()).key != key);
        before - self.0.len()
    }

    /// Append a parameter.
    pub fn push(&mut self, param: impl Into<String>) {
        self.0.push(param.into());
    }

    /// Extend with all parameters of `other`.
    pub fn extend(&mut self, other: Cmdline) {
        self.0.extend(other.0)
    }
}

/// A single kernel command line parameter key.
///
/// Dashes and underscores in keys are equivalent.
#[derive(Debug, Clone, Copy, Eq)]
pub struct ParameterKey<'a>(pub &'a str);

impl PartialEq for ParameterKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        let dedashed = |c: char| if c == '-' { '_' } else { c };
        // Not zip(): leading substrings would compare equal
        self.0.chars().map(dedashed).eq(other.0.chars().map(dedashed))
    }
}

/// A single kernel command line parameter.
#[derive(Debug, Clone, Copy, Eq)]
pub struct Parameter<'a> {
    /// The full original value
    pub parameter: &'a str,
    /// The parameter key
    pub key: ParameterKey<'a>,
    /// The parameter value, if present
    pub value: Option<&'a str>,
}

impl<'a> From<&'a str> for Parameter<'a> {
    /// Splits on the first `=`; only the outermost pair of double quotes is
    /// stripped from the value.
    fn from(parameter: &'a str) -> Self {
        let (key, value) = match parameter.split_once('=') {
            Some((key, value)) => {
                let value = value
                    .strip_prefix('"')
                    .unwrap_or(value)
                    .strip_suffix('"')
                    .unwrap_or(value);
                (key, Some(value))
            }
            None => (parameter, None),
        };
        Self {
            parameter,
            key: ParameterKey(key),
            value,
        }
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        // Not comparing `parameter`, for dash/underscore insensitivity of the key
        self.key == other.key && self.value == other.value
    }
}

/// Normalize the root device of a user command line: every existing `root=`
/// argument is dropped and a single one for `root` is appended.
pub fn with_root(cmdline: &str, root: &str) -> Cmdline {
    let mut c = Cmdline::from(cmdline);
    let removed = c.remove_all(ROOT);
    if removed > 1 {
        tracing::debug!("Dropped {removed} root= arguments from kernel command line");
    }
    c.push(format!("{ROOT}={root}"));
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_simple() {
        let switch = Parameter::from("foo");
        assert_eq!(switch.key.0, "foo");
        assert_eq!(switch.value, None);

        let kv = Parameter::from("bar=baz");
        assert_eq!(kv.key.0, "bar");
        assert_eq!(kv.value, Some("baz"));

        let p = Parameter::from("foo=\"internal \" quotes \" are ok\"");
        assert_eq!(p.value, Some("internal \" quotes \" are ok"));

        // The value of root= may itself contain `=`
        let p = Parameter::from("root=PARTUUID=abcd");
        assert_eq!(p.value, Some("PARTUUID=abcd"));
    }

    #[test]
    fn test_parameter_equality() {
        assert_ne!(Parameter::from("foo"), Parameter::from("foobar"));
        assert_eq!(
            Parameter::from("a-delimited-param=same"),
            Parameter::from("a_delimited_param=same")
        );
        assert_ne!(Parameter::from("same_key"), Parameter::from("same_key=v"));
    }

    #[test]
    fn test_split_quotes() {
        let c = Cmdline::from("  foo=\"a b\"   baz  wiz=1 ");
        assert_eq!(c, Cmdline(vec!["foo=\"a b\"".into(), "baz".into(), "wiz=1".into()]));
        assert_eq!(c.to_string(), "foo=\"a b\" baz wiz=1");
        assert_eq!(Cmdline::from(" "), Cmdline::default());
    }

    #[test]
    fn test_remove_dash_hyphen() {
        let mut c = Cmdline::from("a-b=1 ro a_b=2 a_bc=3");
        assert_eq!(c.remove_all("a_b"), 2);
        assert_eq!(c.to_string(), "ro a_bc=3");
        assert_eq!(c.remove_all("missing"), 0);
    }

    #[test]
    fn test_remove_push_extend() {
        let mut c = Cmdline::from("console=ttyS0 ro rd_break console=tty0");
        assert_eq!(c.remove_all("console"), 2);
        assert_eq!(c.to_string(), "ro rd_break");
        c.push("quiet");
        assert_eq!(c.to_string(), "ro rd_break quiet");
        c.extend(Cmdline::from("a=1  b"));
        assert_eq!(c.to_string(), "ro rd_break quiet a=1 b");
    }

    #[test]
    fn test_with_root() {
        let c = with_root(
            "root=/dev/sda1 console=ttyS0 root=LABEL=x quiet rootflags=ro",
            "PARTUUID=1234",
        );
        assert_eq!(
            c.to_string(),
            "console=ttyS0 quiet rootflags=ro root=PARTUUID=1234"
        );
        assert_eq!(c.0.iter().filter(|p| p.starts_with("root=")).count(), 1);

        let c = with_root("", "/dev/mapper/root");
        assert_eq!(c.to_string(), "root=/dev/mapper/root");
    }
}
