//! Interactive prompt for the srpc client.
//!
//! Every line typed at the prompt is sent as one query, except for the dot
//! commands below.
use std::io::{self, BufRead, Write};

use thiserror::Error;

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, also issued at end of input
    Exit,
    /// Show the local address `.details`
    Details,
    /// Anything else is a query
    Call(String),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CliError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim_end() {
        ".exit" => Ok(Command::Exit),
        ".details" => Ok(Command::Details),
        s if !s.starts_with('.') => Ok(Command::Call(s.to_string())),
        s => Err(CliError::Unrecognized(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_queries() {
        let input = b"SQL:select * from Flows\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Call("SQL:select * from Flows".to_string()), res);
    }

    #[test]
    fn prompt_handles_details() {
        let input = b".details\n";
        let res = prompt(&input[..], Vec::new()).unwrap();
        assert_eq!(Command::Details, res);
    }

    #[test]
    fn end_of_input_exits() {
        let res = prompt(&b""[..], Vec::new()).unwrap();
        assert_eq!(Command::Exit, res);
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        let err = prompt(&input[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }
}
