//! Output path templates.
//!
//! Templates are relative paths with `{variable}` placeholders, e.g.
//! `{roomid}/{year}-{month}-{day}/{uname}_{hour}{minute}{second}`. The
//! caller supplies the variable values; expansion sanitizes them so a stream
//! title cannot escape the output directory or produce an invalid filename.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

/// Characters not allowed inside a single path segment.
const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Error, PartialEq)]
pub enum PathTemplateError {
    #[error("unknown template variable: {{{0}}}")]
    UnknownVariable(String),

    #[error("unterminated template variable")]
    UnterminatedVariable,

    #[error("forbidden character {0:?} in template segment {1:?}")]
    ForbiddenCharacter(char, String),

    #[error("template expands to an empty path")]
    Empty,
}

/// Replace forbidden filename characters with full-width lookalikes and trim
/// the result so it is usable as one path segment.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' => '＼',
            '/' => '／',
            ':' => '：',
            '*' => '＊',
            '?' => '？',
            '"' => '＂',
            '<' => '＜',
            '>' => '＞',
            '|' => '｜',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Expand a path template against the given variables.
///
/// `/` in the template literal separates path segments; substituted values
/// are sanitized, while forbidden characters written literally into the
/// template are rejected.
pub fn expand_path_template(
    template: &str,
    vars: &HashMap<&str, String>,
) -> Result<PathBuf, PathTemplateError> {
    let mut path = PathBuf::new();

    for segment in template.split('/') {
        if segment.is_empty() {
            continue;
        }
        let expanded = expand_segment(segment, vars)?;
        let expanded = expanded.trim();
        if expanded.is_empty() || expanded == "." || expanded == ".." {
            continue;
        }
        path.push(expanded);
    }

    if path.as_os_str().is_empty() {
        return Err(PathTemplateError::Empty);
    }
    Ok(path)
}

fn expand_segment(
    segment: &str,
    vars: &HashMap<&str, String>,
) -> Result<String, PathTemplateError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => name.push(c),
                    None => return Err(PathTemplateError::UnterminatedVariable),
                }
            }
            let value = vars
                .get(name.as_str())
                .ok_or(PathTemplateError::UnknownVariable(name))?;
            out.push_str(&sanitize_filename(value));
        } else if FORBIDDEN.contains(&c) {
            return Err(PathTemplateError::ForbiddenCharacter(c, segment.to_string()));
        } else {
            out.push(c);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("roomid", "23058".to_string()),
            ("uname", "some/streamer".to_string()),
            ("title", "弹幕 : 测试?".to_string()),
            ("year", "2024".to_string()),
            ("month", "07".to_string()),
            ("day", "15".to_string()),
        ])
    }

    #[test]
    fn test_basic_expansion() {
        let path =
            expand_path_template("{roomid}/{year}-{month}-{day}/{title}", &vars()).unwrap();
        assert_eq!(path, PathBuf::from("23058/2024-07-15/弹幕 ： 测试？"));
    }

    #[test]
    fn test_values_cannot_inject_separators() {
        let path = expand_path_template("{uname}", &vars()).unwrap();
        // The '/' in the substituted value became full-width, one segment.
        assert_eq!(path.components().count(), 1);
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let err = expand_path_template("{nope}", &vars()).unwrap_err();
        assert_eq!(err, PathTemplateError::UnknownVariable("nope".to_string()));
    }

    #[test]
    fn test_literal_forbidden_character_rejected() {
        let err = expand_path_template("a:b/{roomid}", &vars()).unwrap_err();
        assert!(matches!(err, PathTemplateError::ForbiddenCharacter(':', _)));
    }

    #[test]
    fn test_unterminated_variable_rejected() {
        let err = expand_path_template("{roomid", &vars()).unwrap_err();
        assert_eq!(err, PathTemplateError::UnterminatedVariable);
    }

    #[test]
    fn test_empty_template_rejected() {
        assert_eq!(
            expand_path_template("//", &vars()).unwrap_err(),
            PathTemplateError::Empty
        );
    }
}
