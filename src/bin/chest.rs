//! chest CLI - password-protected messages and files
//!
//! Command-line interface for sealing messages and files into envelopes
//! using NaCl secretbox (XSalsa20Poly1305) with Argon2id key derivation.

use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

use chest::commands::{self, Command, Context, Mode};
use chest::passphrase::{
    Passphrase, PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader,
};
use chest::secure_buffer::SecureBuffer;

#[derive(Parser)]
#[command(name = "chest")]
#[command(version)]
#[command(about = "Password-protected messages and files.", long_about = None)]
#[command(after_help = "A password given as an argument may be recorded in your shell \
history. Omit it to be prompted instead.")]
struct Cli {
    /// Read password from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Log filter (error, warn, info, debug, trace), written to stderr
    #[arg(
        long,
        global = true,
        env = "CHEST_LOG",
        default_value = "warn",
        value_parser = parse_log_filter
    )]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a message and store it in a file
    #[command(alias = "em")]
    EncryptMessage {
        /// Path to the file to write the envelope to
        path: PathBuf,
        /// The message to encrypt
        message: String,
        /// Password (prompted for when omitted)
        password: Option<String>,
    },

    /// Encrypt a file
    #[command(alias = "ef")]
    EncryptFile {
        /// Path to the file whose contents is to be encrypted
        input: PathBuf,
        /// Path to the file to write the envelope to
        output: PathBuf,
        /// Password (prompted for when omitted)
        password: Option<String>,
    },

    /// Decrypt a file and print its contents
    #[command(alias = "d")]
    Decrypt {
        /// Path to the envelope to decrypt
        path: PathBuf,
        /// Password (prompted for when omitted)
        password: Option<String>,
    },

    /// Decrypt a file into another file
    #[command(alias = "df")]
    DecryptToFile {
        /// Path to the envelope to decrypt
        input: PathBuf,
        /// Path to the file to write the decrypted contents to
        output: PathBuf,
        /// Password (prompted for when omitted)
        password: Option<String>,
    },

    /// Update an encrypted file with new content, while validating
    /// that the password is not accidentally changed.
    #[command(alias = "u")]
    Update {
        /// Path to the file whose contents is to be encrypted
        input: PathBuf,
        /// Path to the existing envelope to replace
        output: PathBuf,
        /// Password (prompted for when omitted)
        password: Option<String>,
    },

    /// Start an interactive session
    #[command(alias = "p")]
    Prompt,
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        let password = |p: Option<String>| p.as_deref().map(Passphrase::from);
        match command {
            Commands::EncryptMessage {
                path,
                message,
                password: pw,
            } => Command::EncryptMessage {
                path,
                message: SecureBuffer::from_slice(message.as_bytes()),
                password: password(pw),
            },
            Commands::EncryptFile {
                input,
                output,
                password: pw,
            } => Command::EncryptFile {
                input,
                output,
                password: password(pw),
            },
            Commands::Decrypt { path, password: pw } => Command::Decrypt {
                path,
                password: password(pw),
            },
            Commands::DecryptToFile {
                input,
                output,
                password: pw,
            } => Command::DecryptToFile {
                input,
                output,
                password: password(pw),
            },
            Commands::Update {
                input,
                output,
                password: pw,
            } => Command::Update {
                input,
                output,
                password: password(pw),
            },
            Commands::Prompt => Command::Prompt,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let command = Command::from(cli.command);

    // The prompt owns stdin; every other command may need it for the password.
    let stdin = io::stdin();
    let mut input: Box<dyn BufRead> = match command {
        Command::Prompt => Box::new(stdin.lock()),
        _ => Box::new(io::empty()),
    };
    let mut reader = get_passphrase_reader(cli.passphrase_stdin);
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr();

    let mut ctx = Context {
        input: &mut *input,
        output: &mut stdout,
        errors: &mut stderr,
        passphrase_reader: Some(&mut *reader),
    };

    if let Err(e) = commands::run(command, Mode::OneShot, &mut ctx) {
        eprintln!("Error: {}", e.display_chain());
        process::exit(1);
    }
}

fn parse_log_filter(value: &str) -> Result<String, String> {
    EnvFilter::try_new(value)
        .map(|_| value.to_owned())
        .map_err(|e| format!("invalid log filter: {}", e))
}

fn init_tracing(filter: &str) {
    let filter = match EnvFilter::try_new(filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Warning: invalid log filter '{}' ({}), using 'warn'", filter, e);
            EnvFilter::new("warn")
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn get_passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(io::stdin())))
    } else {
        Box::new(TerminalPassphraseReader)
    }
}
