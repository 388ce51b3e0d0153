//! Load-options parsing.

use crate::error::UsageError;

pub const USAGE: &str = "usage: slbounce.efi <path to tcblaunch.exe>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Args<'a> {
    pub applet: &'a str,
}

/// Parse the shell command line: the image name, then exactly one applet path.
///
/// Double quotes group a path containing spaces.
pub fn parse_load_options(options: &str) -> Result<Args<'_>, UsageError> {
    let mut words = Words { rest: options };
    let _image = words.next();
    let applet = words.next().ok_or(UsageError::MissingApplet)?;
    match words.count() {
        0 => Ok(Args { applet }),
        extra => Err(UsageError::TooManyArguments(extra)),
    }
}

struct Words<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Words<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start_matches(|c: char| c.is_whitespace() || c == '\0');
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let (word, tail) = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '\0')
                .unwrap_or(rest.len());
            (&rest[..end], &rest[end..])
        };
        self.rest = tail;
        Some(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_applet_path() {
        assert_eq!(
            parse_load_options("slbounce.efi tcblaunch.exe"),
            Ok(Args {
                applet: "tcblaunch.exe"
            })
        );
        assert_eq!(
            parse_load_options("  fs0:\\slbounce.efi   \\EFI\\tcblaunch.exe\0"),
            Ok(Args {
                applet: "\\EFI\\tcblaunch.exe"
            })
        );
    }

    #[test]
    fn quoted_paths_keep_their_spaces() {
        assert_eq!(
            parse_load_options("slbounce.efi \"My Files\\tcblaunch.exe\""),
            Ok(Args {
                applet: "My Files\\tcblaunch.exe"
            })
        );
    }

    #[test]
    fn wrong_argument_counts() {
        assert_eq!(parse_load_options("slbounce.efi"), Err(UsageError::MissingApplet));
        assert_eq!(parse_load_options(""), Err(UsageError::MissingApplet));
        assert_eq!(
            parse_load_options("slbounce.efi a.exe b c"),
            Err(UsageError::TooManyArguments(2))
        );
    }
}
