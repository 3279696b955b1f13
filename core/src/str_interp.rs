//! Two small template languages:
//!
//! - [`interp`] expands `#{var}` and is used by executor command lines in `kvalid.toml`,
//!   where `{}` must stay literal for the shell.
//! - [`format_braces`] expands `{var}` with `{{`/`}}` escapes and is used by validator
//!   argument templates such as `--group st{batch_no}`.

use std::{borrow::Borrow, collections::HashMap, hash::Hash};

pub type Result = std::result::Result<String, InterpError>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InterpError {
    #[error("Undefined variable '{0}' at {}", .1+1)]
    UndefinedVar(String, usize),

    #[error("Unclosed brace (found open brace at {})", .0+1)]
    UnclosedBrace(usize),

    #[error("Single '}}' encountered at {}", .0+1)]
    UnmatchedCloseBrace(usize),
}

pub fn interp<K, V>(fmt: &str, variables: &HashMap<K, V>) -> Result
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
{
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Normal,
        HashMark,
        InsideBrace,
    }
    use State::*;

    let mut state = Normal;
    let mut pos_open_brace = 0;
    let mut res = String::with_capacity(fmt.len() * 2);
    let mut var_name = String::with_capacity(16);

    for (i, c) in fmt.chars().enumerate() {
        match (c, state) {
            ('#', Normal) => {
                state = HashMark;
                res.push(c);
            }
            ('#', HashMark) => {
                state = Normal;
            }
            ('{', HashMark) => {
                state = InsideBrace;
                pos_open_brace = i;
                var_name.clear();
                res.pop(); // remove '#'
            }
            ('}', InsideBrace) => {
                state = Normal;
                let Some(value) = variables.get(var_name.as_str()) else {
                    return Err(InterpError::UndefinedVar(var_name, pos_open_brace + 1))
                };
                res += value.as_ref();
            }
            (_, InsideBrace) => {
                var_name.push(c);
            }
            _ => {
                state = Normal;
                res.push(c);
            }
        }
    }

    if state == InsideBrace {
        Err(InterpError::UnclosedBrace(pos_open_brace))
    } else {
        Ok(res)
    }
}

pub fn format_braces<K, V>(fmt: &str, variables: &HashMap<K, V>) -> Result
where
    K: Borrow<str> + Hash + Eq,
    V: AsRef<str>,
{
    let mut res = String::with_capacity(fmt.len() * 2);
    let mut chars = fmt.chars().enumerate().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                res.push('{');
            }
            '{' => {
                let mut var_name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, c)) => var_name.push(c),
                        None => return Err(InterpError::UnclosedBrace(i)),
                    }
                }
                let Some(value) = variables.get(var_name.as_str()) else {
                    return Err(InterpError::UndefinedVar(var_name, i + 1))
                };
                res += value.as_ref();
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                res.push('}');
            }
            '}' => return Err(InterpError::UnmatchedCloseBrace(i)),
            _ => res.push(c),
        }
    }
    Ok(res)
}

#[cfg(test)]
mod test {
    use maplit::hashmap;

    use super::*;

    #[test]
    fn interp_ok() {
        let vars = hashmap! {
            "dir" => "/tmp/build",
            "exe" => "/tmp/build/validator",
            "main" => "/tmp/build/validator.cpp",
        };

        assert_eq!(interp("hello", &vars).unwrap(), "hello");
        assert_eq!(interp("#{exe}", &vars).unwrap(), vars["exe"]);
        assert_eq!(
            interp("g++ -O2 -o #{exe} #{main}", &vars).unwrap(),
            "g++ -O2 -o /tmp/build/validator /tmp/build/validator.cpp"
        );
        assert_eq!(interp("cd #{dir}&&ls", &vars).unwrap(), "cd /tmp/build&&ls");
        assert_eq!(interp("echo {dir}", &vars).unwrap(), "echo {dir}");
        assert_eq!(interp("echo # {dir}", &vars).unwrap(), "echo # {dir}");
        assert_eq!(interp("echo ##{dir}", &vars).unwrap(), "echo #{dir}");
        assert_eq!(interp("#", &vars).unwrap(), "#");
        assert_eq!(interp("##", &vars).unwrap(), "#");
        assert_eq!(interp("###", &vars).unwrap(), "##");
    }

    #[test]
    fn interp_ng() {
        let vars = hashmap! { "exe" => "a.out" };
        assert_eq!(
            interp("#{main} #{exe}", &vars).unwrap_err(),
            InterpError::UndefinedVar("main".to_owned(), 2)
        );
        assert_eq!(
            interp("#{exe} #{dir", &vars).unwrap_err(),
            InterpError::UnclosedBrace(8),
        );
    }

    #[test]
    fn format_braces_ok() {
        let vars = hashmap! {
            "batch_no" => "2".to_owned(),
            "case_no" => "13".to_owned(),
        };

        assert_eq!(
            format_braces("{batch_no} {case_no}", &vars).unwrap(),
            "2 13"
        );
        assert_eq!(
            format_braces("--group st{batch_no}", &vars).unwrap(),
            "--group st2"
        );
        assert_eq!(format_braces("{{case_no}}", &vars).unwrap(), "{case_no}");
        assert_eq!(format_braces("{{{case_no}}}", &vars).unwrap(), "{13}");
        assert_eq!(format_braces("", &vars).unwrap(), "");
    }

    #[test]
    fn format_braces_ng() {
        let vars = hashmap! { "case_no" => "1" };
        assert_eq!(
            format_braces("{test_no}", &vars).unwrap_err(),
            InterpError::UndefinedVar("test_no".to_owned(), 1)
        );
        assert_eq!(
            format_braces("x {case_no", &vars).unwrap_err(),
            InterpError::UnclosedBrace(2)
        );
        assert_eq!(
            format_braces("x }", &vars).unwrap_err(),
            InterpError::UnmatchedCloseBrace(2)
        );
    }
}
