//! cairn-cli - command-line client built on the cairn library.
//!
//! Runs one command, a batch from stdin, or an interactive prompt against
//! a single node, a server-assisted cluster or a sharded set of nodes.

use anyhow::{bail, Context};
use bytes::Bytes;
use cairn::pipeline::PipelineMode;
use cairn::{Client, Command, Config, Mode, Value};
use std::io::{self, BufRead, Read, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// CLI options
struct Options {
    host: String,
    port: u16,
    uri: Option<String>,
    nodes: Vec<String>,
    config_file: Option<String>,
    password: Option<String>,
    database: i64,
    mode: Mode,
    repeat: u32,
    interval: Duration,
    json: bool,
    pipe: bool,
    read_stdin_arg: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: cairn::DEFAULT_PORT,
            uri: None,
            nodes: Vec::new(),
            config_file: None,
            password: None,
            database: 0,
            mode: Mode::Single,
            repeat: 1,
            interval: Duration::ZERO,
            json: false,
            pipe: false,
            read_stdin_arg: false,
        }
    }
}

impl Options {
    fn prompt(&self) -> String {
        match (&self.uri, self.database) {
            (Some(uri), _) => format!("{uri}> "),
            (None, 0) => format!("{}:{}> ", self.host, self.port),
            (None, db) => format!("{}:{}[{db}]> ", self.host, self.port),
        }
    }

    fn client_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_file {
            Some(path) => Config::load_from_file(path)
                .with_context(|| format!("could not load {path}"))?,
            None => Config::new(),
        };
        if self.config_file.is_none() || self.mode != Mode::Single {
            config = config.mode(self.mode);
        }
        if config.nodes.is_empty() {
            let primary = match &self.uri {
                Some(uri) => uri.clone(),
                None => format!("tcp://{}:{}", self.host, self.port),
            };
            config = config.node(&primary)?;
        }
        for node in &self.nodes {
            config = config.node(node)?;
        }
        if let Some(password) = &self.password {
            config = config.password(password.clone());
        }
        if self.database != 0 {
            config = config.database(self.database);
        }
        // errors are printed inline like any other reply
        Ok(config.exceptions(false))
    }
}

fn print_usage() {
    println!(
        "Usage: cairn-cli [OPTIONS] [COMMAND [ARG...]]

Command line client for Redis-compatible servers.

Options:
  -h <hostname>      Server hostname (default: 127.0.0.1)
  -p <port>          Server port (default: 6379)
  -u <uri>           Server URI (tcp://host:port?..., unix:///path)
  -a <password>      Password for AUTH
  -n <database>      Database number (default: 0)
  -c <file>          Load client configuration from a file
  -r <repeat>        Execute command N times
  -i <interval>      Interval between repeats (seconds)
  -x                 Read last argument from STDIN
  --node <uri>       Additional node (repeatable)
  --cluster          Server-assisted cluster mode
  --sharded          Client-side sharding over every node
  --json             Print replies as JSON
  --pipe             Read commands from stdin and send them as one pipeline
  --help             Show this help message

Examples:
  cairn-cli                                    Interactive mode
  cairn-cli PING                               Single command
  cairn-cli -h cache.internal GET key
  cairn-cli --cluster -p 7000 SET user:1 x     Follow MOVED/ASK redirections
  cairn-cli --sharded --node tcp://b:6379 GET k
  cairn-cli --pipe < commands.txt              Pipe mode

Interactive commands:
  help      Show this message
  quit      Exit the CLI
  clear     Clear screen
"
    );
}

/// Parse input line into arguments (handling quotes)
fn parse_input(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            current.push(match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escape_next = false;
            continue;
        }

        match ch {
            '\\' => escape_next = true,
            c if in_quotes && c == quote_char => in_quotes = false,
            c if in_quotes => current.push(c),
            '"' | '\'' => {
                in_quotes = true;
                quote_char = ch;
            }
            ' ' | '\t' => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

fn build_command(client: &Client, args: &[String]) -> Option<Command> {
    let (id, rest) = args.split_first()?;
    let id = id.to_ascii_uppercase();
    let arguments = rest.iter().map(|a| Bytes::from(a.clone())).collect();
    let mut command = client.table().create_raw(&id, arguments);
    if let Some(prefix) = client.prefix() {
        prefix.apply(&mut command);
    }
    Some(command)
}

/// Render a reply the way interactive users expect.
fn format_value(value: &Value, indent: usize) -> String {
    match value {
        Value::Nil => "(nil)".to_string(),
        Value::Okay => "OK".to_string(),
        Value::Queued => "QUEUED".to_string(),
        Value::Status(s) => s.clone(),
        Value::Int(n) => format!("(integer) {n}"),
        Value::Bool(b) => format!("(integer) {}", i64::from(*b)),
        Value::Data(data) => format!("\"{}\"", String::from_utf8_lossy(data)),
        Value::Error(e) => format!("(error) {e}"),
        Value::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Value::Array(items) => {
            let pad = " ".repeat(indent);
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let prefix = format!("{}) ", i + 1);
                    let body = format_value(item, indent + prefix.len());
                    let line = format!("{prefix}{body}");
                    if i == 0 {
                        line
                    } else {
                        format!("{pad}{line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Map(pairs) if pairs.is_empty() => "(empty hash)".to_string(),
        Value::Map(pairs) => {
            let pad = " ".repeat(indent);
            pairs
                .iter()
                .enumerate()
                .map(|(i, (k, v))| {
                    let line = format!(
                        "{}) {} => {}",
                        i + 1,
                        format_value(k, 0),
                        format_value(v, indent + 4)
                    );
                    if i == 0 {
                        line
                    } else {
                        format!("{pad}{line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Nil => Json::Null,
        Value::Okay => Json::String("OK".into()),
        Value::Queued => Json::String("QUEUED".into()),
        Value::Status(s) => Json::String(s.clone()),
        Value::Int(n) => Json::from(*n),
        Value::Bool(b) => Json::Bool(*b),
        Value::Data(data) => Json::String(String::from_utf8_lossy(data).into_owned()),
        Value::Error(e) => serde_json::json!({ "error": e.to_string() }),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => {
            let map = pairs
                .iter()
                .map(|(k, v)| {
                    let key = k
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format_value(k, 0));
                    (key, to_json(v))
                })
                .collect();
            Json::Object(map)
        }
    }
}

fn print_value(options: &Options, value: &Value) {
    if options.json {
        println!("{}", to_json(value));
    } else {
        println!("{}", format_value(value, 0));
    }
}

fn run_once(options: &Options, client: &mut Client, args: &[String]) -> anyhow::Result<()> {
    let Some(command) = build_command(client, args) else {
        return Ok(());
    };
    for round in 0..options.repeat {
        if round > 0 && options.interval > Duration::ZERO {
            std::thread::sleep(options.interval);
        }
        let value = client.execute(command.clone())?;
        print_value(options, &value);
    }
    Ok(())
}

/// Run single command mode
fn run_command(options: &Options, args: &[String]) -> anyhow::Result<()> {
    let mut client = Client::new(options.client_config()?)?;
    run_once(options, &mut client, args)
}

/// Read commands from stdin and send them as one pipeline
fn run_pipe(options: &Options) -> anyhow::Result<()> {
    let mut client = Client::new(options.client_config()?)?;
    let mut commands = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line.context("could not read stdin")?;
        let args = parse_input(line.trim());
        if let Some(command) = build_command(&client, &args) {
            commands.push(command);
        }
    }
    let total = commands.len();

    let mut pipeline = client.pipeline_with(PipelineMode::Safe);
    for command in commands {
        pipeline.push(command);
    }
    let values = pipeline.execute()?;
    let errors = values.iter().filter(|v| v.is_error()).count();
    for value in values.iter().filter(|v| v.is_error()) {
        print_value(options, value);
    }
    eprintln!("All data transferred. errors: {errors}, replies: {total}");
    Ok(())
}

/// Interactive REPL mode
fn run_interactive(options: &Options) -> anyhow::Result<()> {
    let mut client = Client::new(options.client_config()?)?;
    client
        .connect()
        .with_context(|| format!("could not connect to {}", options.prompt().trim_end_matches("> ")))?;

    println!("Type 'help' for usage, 'quit' to exit.\n");

    loop {
        print!("{}", options.prompt());
        io::stdout().flush().ok();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input.to_lowercase().as_str() {
            "quit" | "exit" => break,
            "clear" => {
                print!("\x1B[2J\x1B[1;1H");
                continue;
            }
            "help" => {
                print_usage();
                continue;
            }
            _ => {}
        }

        let args = parse_input(input);
        if let Err(e) = run_once(options, &mut client, &args) {
            // the connection reopens on the next command
            eprintln!("(error) {e}");
        }
    }

    Ok(())
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a String> {
    *i += 1;
    args.get(*i).with_context(|| format!("{flag} needs a value"))
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<(Options, Vec<String>)>> {
    let mut options = Options::default();
    let mut command_args = Vec::new();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || take_value(args, &mut i, flag);
        match flag {
            "-h" => options.host = value()?.clone(),
            "-p" => options.port = value()?.parse().context("invalid port")?,
            "-u" => options.uri = Some(value()?.clone()),
            "-a" => options.password = Some(value()?.clone()),
            "-n" => options.database = value()?.parse().context("invalid database")?,
            "-c" => options.config_file = Some(value()?.clone()),
            "-r" => options.repeat = value()?.parse().context("invalid repeat count")?,
            "-i" => {
                let secs: f64 = value()?.parse().context("invalid interval")?;
                options.interval = Duration::from_secs_f64(secs.max(0.0));
            }
            "-x" => options.read_stdin_arg = true,
            "--node" => options.nodes.push(value()?.clone()),
            "--cluster" => options.mode = Mode::Cluster,
            "--sharded" => options.mode = Mode::Sharded,
            "--json" => options.json = true,
            "--pipe" => options.pipe = true,
            "--help" | "-?" => {
                print_usage();
                return Ok(None);
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            _ => {
                command_args.extend(args[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }

    if options.read_stdin_arg && !command_args.is_empty() {
        let mut stdin_data = String::new();
        io::stdin()
            .read_to_string(&mut stdin_data)
            .context("could not read stdin")?;
        command_args.push(stdin_data.trim_end().to_string());
    }

    Ok(Some((options, command_args)))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let result = parse_args(&args).and_then(|parsed| match parsed {
        None => Ok(()),
        Some((options, _)) if options.pipe => run_pipe(&options),
        Some((options, command)) if command.is_empty() => run_interactive(&options),
        Some((options, command)) => run_command(&options, &command),
    });

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
