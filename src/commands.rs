//! Command parsing and dispatch
//!
//! Both the command line and the interactive prompt funnel into
//! [`Command`] and [`run`]. Positional arguments follow the same order in
//! both places, with the password last:
//!
//! ```text
//! encrypt-message <path> <message> [password]
//! encrypt-file <input> <output> [password]
//! decrypt <path> [password]
//! decrypt-to-file <input> <output> [password]
//! update <input> <output> [password]
//! ```
//!
//! Whether an interactive session is already running is carried by the
//! [`Mode`] argument of [`run`], not by global state.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::{ChestError, ErrorCategory, ErrorKind, Result};
use crate::file_ops;
use crate::passphrase::{ConstantPassphraseReader, Passphrase, PassphraseReader};
use crate::secure_buffer::SecureBuffer;

const PROMPT: &str = "chest> ";

const SHELL_HISTORY_WARNING: &str = "Warning: a password given as an argument may be recorded in \
your shell history. Omit it to be prompted instead.";

#[derive(Clone, Copy)]
enum Verb {
    EncryptMessage,
    EncryptFile,
    Decrypt,
    DecryptToFile,
    Update,
    Prompt,
    Help,
    Exit,
}

struct CommandInfo {
    verb: Verb,
    name: &'static str,
    alias: &'static str,
    usage: &'static str,
    about: &'static str,
}

const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        verb: Verb::EncryptMessage,
        name: "encrypt-message",
        alias: "em",
        usage: "encrypt-message <path> <message> [password]",
        about: "encrypt <message> and store it at <path>",
    },
    CommandInfo {
        verb: Verb::EncryptFile,
        name: "encrypt-file",
        alias: "ef",
        usage: "encrypt-file <input> <output> [password]",
        about: "encrypt the file <input> into <output>",
    },
    CommandInfo {
        verb: Verb::Decrypt,
        name: "decrypt",
        alias: "d",
        usage: "decrypt <path> [password]",
        about: "decrypt <path> and print its contents",
    },
    CommandInfo {
        verb: Verb::DecryptToFile,
        name: "decrypt-to-file",
        alias: "df",
        usage: "decrypt-to-file <input> <output> [password]",
        about: "decrypt <input> and write its contents to <output>",
    },
    CommandInfo {
        verb: Verb::Update,
        name: "update",
        alias: "u",
        usage: "update <input> <output> [password]",
        about: "re-encrypt <input> into the existing <output>, keeping its password",
    },
    CommandInfo {
        verb: Verb::Prompt,
        name: "prompt",
        alias: "p",
        usage: "prompt",
        about: "start an interactive session",
    },
    CommandInfo {
        verb: Verb::Help,
        name: "help",
        alias: "h",
        usage: "help [command]",
        about: "show help for all commands or for one",
    },
    CommandInfo {
        verb: Verb::Exit,
        name: "exit",
        alias: "q",
        usage: "exit",
        about: "leave the interactive session",
    },
];

fn lookup(word: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|c| c.name == word || c.alias == word)
}

/// Whether a command runs standalone or inside the interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    OneShot,
    Interactive,
}

/// What the caller should do after a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug)]
pub enum Command {
    EncryptMessage {
        path: PathBuf,
        message: SecureBuffer,
        password: Option<Passphrase>,
    },
    EncryptFile {
        input: PathBuf,
        output: PathBuf,
        password: Option<Passphrase>,
    },
    Decrypt {
        path: PathBuf,
        password: Option<Passphrase>,
    },
    DecryptToFile {
        input: PathBuf,
        output: PathBuf,
        password: Option<Passphrase>,
    },
    Update {
        input: PathBuf,
        output: PathBuf,
        password: Option<Passphrase>,
    },
    Prompt,
    Help {
        topic: Option<String>,
    },
    Exit,
}

impl Command {
    /// Parse a command word followed by its positional arguments.
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Result<Command> {
        let (verb, rest) = words.split_first().ok_or_else(|| {
            ChestError::with_kind(
                ErrorCategory::User,
                ErrorKind::ArgumentMissing,
                "no command given; try 'help'",
            )
        })?;
        let info = lookup(verb.as_ref()).ok_or_else(|| {
            ChestError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnknownCommand,
                format!("unknown command '{}'; try 'help'", verb.as_ref()),
            )
        })?;

        let mut args = Args {
            info,
            rest: rest.iter().map(|s| s.as_ref()),
        };
        let command = match info.verb {
            Verb::EncryptMessage => Command::EncryptMessage {
                path: args.required("path")?.into(),
                message: SecureBuffer::from_slice(args.required("message")?.as_bytes()),
                password: args.password(),
            },
            Verb::EncryptFile => Command::EncryptFile {
                input: args.required("input")?.into(),
                output: args.required("output")?.into(),
                password: args.password(),
            },
            Verb::Decrypt => Command::Decrypt {
                path: args.required("path")?.into(),
                password: args.password(),
            },
            Verb::DecryptToFile => Command::DecryptToFile {
                input: args.required("input")?.into(),
                output: args.required("output")?.into(),
                password: args.password(),
            },
            Verb::Update => Command::Update {
                input: args.required("input")?.into(),
                output: args.required("output")?.into(),
                password: args.password(),
            },
            Verb::Prompt => Command::Prompt,
            Verb::Help => Command::Help {
                topic: args.optional().map(str::to_owned),
            },
            Verb::Exit => Command::Exit,
        };
        args.finish()?;
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::EncryptMessage { .. } => "encrypt-message",
            Command::EncryptFile { .. } => "encrypt-file",
            Command::Decrypt { .. } => "decrypt",
            Command::DecryptToFile { .. } => "decrypt-to-file",
            Command::Update { .. } => "update",
            Command::Prompt => "prompt",
            Command::Help { .. } => "help",
            Command::Exit => "exit",
        }
    }
}

struct Args<'w, I: Iterator<Item = &'w str>> {
    info: &'static CommandInfo,
    rest: I,
}

impl<'w, I: Iterator<Item = &'w str>> Args<'w, I> {
    fn required(&mut self, what: &str) -> Result<&'w str> {
        self.rest.next().ok_or_else(|| {
            ChestError::with_kind(
                ErrorCategory::User,
                ErrorKind::ArgumentMissing,
                format!("missing <{}>; usage: {}", what, self.info.usage),
            )
        })
    }

    fn optional(&mut self) -> Option<&'w str> {
        self.rest.next()
    }

    fn password(&mut self) -> Option<Passphrase> {
        self.optional().map(Passphrase::from)
    }

    fn finish(mut self) -> Result<()> {
        match self.rest.next() {
            None => Ok(()),
            Some(extra) => Err(ChestError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnexpectedArgument,
                format!(
                    "unexpected argument '{}'; usage: {}",
                    extra, self.info.usage
                ),
            )),
        }
    }
}

/// Streams and the fallback password source a command runs against.
pub struct Context<'a, 'p> {
    /// Lines for the interactive prompt.
    pub input: &'a mut dyn BufRead,
    /// Decrypted output, help text and the prompt itself.
    pub output: &'a mut dyn Write,
    /// Error reports from inside the interactive prompt.
    pub errors: &'a mut dyn Write,
    /// Consulted in one-shot mode when no password argument was given.
    pub passphrase_reader: Option<&'a mut (dyn PassphraseReader + 'p)>,
}

/// Execute one command.
pub fn run(command: Command, mode: Mode, ctx: &mut Context<'_, '_>) -> Result<Flow> {
    debug!(command = command.name(), ?mode, "running command");
    match command {
        Command::EncryptMessage {
            path,
            message,
            password,
        } => {
            let mut slot = None;
            let reader = pick_reader(password, &mut slot, &mut ctx.passphrase_reader, mode)?;
            file_ops::encrypt_message(&message, &path, reader)?;
        }
        Command::EncryptFile {
            input,
            output,
            password,
        } => {
            let mut slot = None;
            let reader = pick_reader(password, &mut slot, &mut ctx.passphrase_reader, mode)?;
            file_ops::encrypt_file(&input, &output, reader)?;
        }
        Command::Decrypt { path, password } => {
            let mut slot = None;
            let reader = pick_reader(password, &mut slot, &mut ctx.passphrase_reader, mode)?;
            let mut sink = LastByteWriter {
                inner: &mut *ctx.output,
                last: None,
            };
            file_ops::decrypt(&path, &mut sink, reader)?;
            // Keep the next prompt on a line of its own.
            if mode == Mode::Interactive && sink.last != Some(b'\n') {
                write_out(ctx.output, b"\n")?;
            }
        }
        Command::DecryptToFile {
            input,
            output,
            password,
        } => {
            let mut slot = None;
            let reader = pick_reader(password, &mut slot, &mut ctx.passphrase_reader, mode)?;
            file_ops::decrypt_to_file(&input, &output, reader)?;
        }
        Command::Update {
            input,
            output,
            password,
        } => {
            let mut slot = None;
            let reader = pick_reader(password, &mut slot, &mut ctx.passphrase_reader, mode)?;
            file_ops::update_file(&input, &output, reader)?;
        }
        Command::Prompt => match mode {
            Mode::OneShot => prompt(ctx)?,
            Mode::Interactive => {
                warn!("already in an interactive session; prompts do not nest");
            }
        },
        Command::Help { topic } => write_help(ctx.output, topic.as_deref())?,
        Command::Exit => return Ok(Flow::Exit),
    }
    Ok(Flow::Continue)
}

/// Read, parse and run commands line by line until `exit` or end of input.
///
/// A failing command is reported on `ctx.errors` and the session goes on.
pub fn prompt(ctx: &mut Context<'_, '_>) -> Result<()> {
    info!("interactive session started");
    // Lines may carry passwords, so they are read into a wiping buffer.
    let mut line = SecureBuffer::with_capacity(1024);
    loop {
        write_out(ctx.output, PROMPT.as_bytes())?;
        line.wipe();
        let n = line.read_line(&mut *ctx.input).map_err(|e| {
            ChestError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to read command",
                e,
            )
        })?;
        if n == 0 {
            write_out(ctx.output, b"\n")?;
            break;
        }

        let outcome = std::str::from_utf8(&line)
            .map_err(|_| {
                ChestError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::UnknownCommand,
                    "command line is not valid UTF-8",
                )
            })
            .and_then(|text| {
                let words: Vec<&str> = text.split_whitespace().collect();
                if words.is_empty() {
                    return Ok(Flow::Continue);
                }
                Command::parse(&words[..]).and_then(|command| run(command, Mode::Interactive, ctx))
            });
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            Err(e) => {
                writeln!(ctx.errors, "Error: {}", e.display_chain()).map_err(|e| {
                    ChestError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::Io,
                        "failed to report error",
                        e,
                    )
                })?;
            }
        }
    }
    info!("interactive session ended");
    Ok(())
}

fn pick_reader<'r, 'p: 'r>(
    password: Option<Passphrase>,
    slot: &'r mut Option<ConstantPassphraseReader>,
    fallback: &'r mut Option<&mut (dyn PassphraseReader + 'p)>,
    mode: Mode,
) -> Result<&'r mut dyn PassphraseReader> {
    if let Some(password) = password {
        let reader: &'r mut dyn PassphraseReader = slot.insert(password.into_reader());
        return Ok(reader);
    }
    match (mode, fallback.as_deref_mut()) {
        (Mode::OneShot, Some(reader)) => {
            let reader: &'r mut dyn PassphraseReader = reader;
            Ok(reader)
        }
        _ => Err(ChestError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArgumentMissing,
            "missing [password]",
        )),
    }
}

fn write_help(out: &mut dyn Write, topic: Option<&str>) -> Result<()> {
    let mut text = String::new();
    match topic {
        Some(word) => {
            let info = lookup(word).ok_or_else(|| {
                ChestError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::UnknownCommand,
                    format!("unknown command '{}'", word),
                )
            })?;
            text.push_str(&help_line(info));
        }
        None => {
            for info in COMMANDS {
                text.push_str(&help_line(info));
            }
            text.push('\n');
            text.push_str(SHELL_HISTORY_WARNING);
            text.push('\n');
        }
    }
    write_out(out, text.as_bytes())
}

fn help_line(info: &CommandInfo) -> String {
    format!("{:<46} ({}) {}\n", info.usage, info.alias, info.about)
}

fn write_out(out: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).and_then(|()| out.flush()).map_err(|e| {
        ChestError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to write output",
            e,
        )
    })
}

/// Remembers the final byte written through it.
struct LastByteWriter<'w> {
    inner: &'w mut dyn Write,
    last: Option<u8>,
}

impl Write for LastByteWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.last = Some(buf[n - 1]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
