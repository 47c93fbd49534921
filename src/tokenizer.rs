//! Shell-like lexer (C3): turns a command-line byte string into a
//! pipeline of programs.
//!
//! Boundary rules (spec §4.3): whitespace separates tokens; single
//! quotes preserve bytes verbatim; double quotes allow backslash escapes
//! of `\\` and `"`; outside quotes, a backslash escapes one space;
//! unquoted `|` splits the token stream into pipeline stages; a stage
//! with zero arguments is a parse error; an unterminated quote or a
//! trailing backslash is a parse error.

use crate::task::Program;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TokenizeError {
    EmptyStage,
    UnterminatedQuote,
    TrailingBackslash,
}

impl std::fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenizeError::EmptyStage => write!(f, "a pipeline stage has no arguments"),
            TokenizeError::UnterminatedQuote => write!(f, "unterminated quote"),
            TokenizeError::TrailingBackslash => write!(f, "trailing backslash"),
        }
    }
}

impl std::error::Error for TokenizeError {}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Mode {
    Bare,
    Single,
    Double,
}

pub fn tokenize(input: &[u8]) -> Result<Vec<Program>, TokenizeError> {
    let mut stages: Vec<Program> = Vec::new();
    let mut stage: Program = Vec::new();
    let mut token: Vec<u8> = Vec::new();
    let mut token_started = false;
    let mut mode = Mode::Bare;
    let mut i = 0usize;

    macro_rules! finish_token {
        () => {
            if token_started {
                stage.push(std::mem::take(&mut token));
                token_started = false;
            }
        };
    }

    while i < input.len() {
        let b = input[i];
        match mode {
            Mode::Bare => match b {
                b' ' | b'\t' => {
                    finish_token!();
                    i += 1;
                }
                b'\'' => {
                    mode = Mode::Single;
                    token_started = true;
                    i += 1;
                }
                b'"' => {
                    mode = Mode::Double;
                    token_started = true;
                    i += 1;
                }
                b'|' => {
                    finish_token!();
                    if stage.is_empty() {
                        return Err(TokenizeError::EmptyStage);
                    }
                    stages.push(std::mem::take(&mut stage));
                    i += 1;
                }
                b'\\' => {
                    if i + 1 >= input.len() {
                        return Err(TokenizeError::TrailingBackslash);
                    }
                    if input[i + 1] == b' ' {
                        token.push(b' ');
                        token_started = true;
                        i += 2;
                    } else {
                        // Outside quotes, backslash only escapes a space
                        // (spec §4.3); anywhere else it is taken
                        // literally.
                        token.push(b'\\');
                        token_started = true;
                        i += 1;
                    }
                }
                other => {
                    token.push(other);
                    token_started = true;
                    i += 1;
                }
            },
            Mode::Single => match b {
                b'\'' => {
                    mode = Mode::Bare;
                    i += 1;
                }
                other => {
                    token.push(other);
                    i += 1;
                }
            },
            Mode::Double => match b {
                b'"' => {
                    mode = Mode::Bare;
                    i += 1;
                }
                b'\\' => {
                    if i + 1 >= input.len() {
                        return Err(TokenizeError::UnterminatedQuote);
                    }
                    match input[i + 1] {
                        b'\\' => {
                            token.push(b'\\');
                            i += 2;
                        }
                        b'"' => {
                            token.push(b'"');
                            i += 2;
                        }
                        other => {
                            token.push(b'\\');
                            token.push(other);
                            i += 2;
                        }
                    }
                }
                other => {
                    token.push(other);
                    i += 1;
                }
            },
        }
    }

    if mode != Mode::Bare {
        return Err(TokenizeError::UnterminatedQuote);
    }

    finish_token!();
    if stage.is_empty() {
        return Err(TokenizeError::EmptyStage);
    }
    stages.push(stage);

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<Vec<String>> {
        tokenize(s.as_bytes())
            .unwrap()
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .map(|a| String::from_utf8(a).unwrap())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn simple_command() {
        assert_eq!(toks("echo hi"), vec![vec!["echo", "hi"]]);
    }

    #[test]
    fn pipeline_splits_on_pipe() {
        assert_eq!(
            toks("printf ab | tr a X"),
            vec![vec!["printf", "ab"], vec!["tr", "a", "X"]]
        );
    }

    #[test]
    fn single_quotes_preserve_verbatim() {
        assert_eq!(toks("echo 'a | b'"), vec![vec!["echo", "a | b"]]);
    }

    #[test]
    fn double_quotes_allow_backslash_escapes() {
        assert_eq!(
            toks(r#"echo "a\"b\\c""#),
            vec![vec!["echo", "a\"b\\c"]]
        );
    }

    #[test]
    fn unquoted_backslash_space_escapes_one_space() {
        assert_eq!(toks(r"echo a\ b"), vec![vec!["echo", "a b"]]);
    }

    #[test]
    fn empty_stage_is_parse_error() {
        assert_eq!(tokenize(b"a ||").unwrap_err(), TokenizeError::EmptyStage);
        assert_eq!(tokenize(b"| a").unwrap_err(), TokenizeError::EmptyStage);
    }

    #[test]
    fn unterminated_quote_is_parse_error() {
        assert_eq!(
            tokenize(b"echo 'unterminated").unwrap_err(),
            TokenizeError::UnterminatedQuote
        );
    }

    #[test]
    fn trailing_backslash_is_parse_error() {
        assert_eq!(
            tokenize(b"echo a\\").unwrap_err(),
            TokenizeError::TrailingBackslash
        );
    }

    #[test]
    fn tokenize_is_idempotent_on_surviving_argv() {
        let first = tokenize(b"echo 'a b' | tr a X").unwrap();
        let rejoined: Vec<u8> = first
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join(" | ");
        let second = tokenize(rejoined.as_bytes()).unwrap();
        assert_eq!(first, second);
    }
}
