//! Command-line surface: leading switches plus up to two positionals.
//!
//! Switches are read left to right until the first token that is not a
//! known switch; everything from there on is positional, even when it
//! looks like a switch. Repeating a switch, or giving more than one
//! action switch, is an invalid command line (`-g` combines with any
//! action). The first positional selects a route — or a variant name
//! under `-m` — and the second a proc.

use thiserror::Error;

use crate::wire::Switch;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid command line")]
    Invalid,
}

/// A parsed invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub sw: Switch,
    /// Use the global manifest (`OP_GLOBAL`).
    pub global: bool,
    /// Route to execute, or meta variant to apply.
    pub major: String,
    /// Proc to execute.
    pub minor: String,
}

enum Token {
    Global,
    Action(Switch),
}

fn switch_token(token: &str) -> Option<Token> {
    match token {
        "-g" => Some(Token::Global),
        "-p" => Some(Token::Action(Switch::Print)),
        "-l" => Some(Token::Action(Switch::List)),
        "-k" => Some(Token::Action(Switch::Kill)),
        "-r" => Some(Token::Action(Switch::Restart)),
        "-s" => Some(Token::Action(Switch::Server)),
        "-e" => Some(Token::Action(Switch::Exit)),
        "-m" => Some(Token::Action(Switch::Meta)),
        _ => None,
    }
}

pub fn parse() -> Result<Invocation, CliError> {
    parse_from(std::env::args().skip(1))
}

/// Parse an argument list (without the program name).
pub fn parse_from<I, S>(args: I) -> Result<Invocation, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tokens: Vec<String> = args.into_iter().map(Into::into).collect();

    let mut global = false;
    let mut action: Option<Switch> = None;
    let mut index = 0;
    while index < tokens.len() {
        let Some(token) = switch_token(&tokens[index]) else {
            break;
        };
        match token {
            Token::Global => {
                if global {
                    return Err(CliError::Invalid);
                }
                global = true;
            }
            Token::Action(sw) => {
                // a repeated switch and a second action are both invalid
                if action.is_some() {
                    return Err(CliError::Invalid);
                }
                action = Some(sw);
            }
        }
        index += 1;
    }

    Ok(Invocation {
        sw: action.unwrap_or_default(),
        global,
        major: tokens.get(index).cloned().unwrap_or_default(),
        minor: tokens.get(index + 1).cloned().unwrap_or_default(),
    })
}
