//! Dockerfile parser for the Strata build system.
//!
//! Parses a Dockerfile into an ordered list of build steps. Supports:
//! - FROM, WORKDIR, COPY, ADD, RUN, CMD, ENTRYPOINT
//! - ENV, ARG (including global ARGs before FROM), LABEL, EXPOSE, USER,
//!   SHELL, STOPSIGNAL
//! - Line continuations and `#` comment lines
//!
//! A Dockerfile describes a single linear stage; a second FROM is rejected.
//! Variable substitution happens later, in [`crate::builder::plan`].

use serde::Serialize;
use std::fmt;

/// A parsed Dockerfile: global build args plus the ordered steps of its stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    /// ARG declarations before FROM, in order
    pub global_args: Vec<(String, Option<String>)>,
    /// Build steps; the first is always `FROM`
    pub steps: Vec<BuildStep>,
}

impl Dockerfile {
    /// The raw (unexpanded) base image reference from the FROM step.
    pub fn base_image(&self) -> &str {
        match self.steps.first().map(|s| &s.instruction) {
            Some(Instruction::From { image, .. }) => image,
            _ => "",
        }
    }
}

/// One instruction in the image construction sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStep {
    /// 1-based position in the step list
    pub number: usize,
    /// Line the instruction starts on
    pub line: usize,
    /// Instruction as written (continuations joined)
    pub text: String,
    /// Parsed instruction
    pub instruction: Instruction,
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Instruction {
    /// FROM [--platform=<platform>] image
    From { image: String, platform: Option<String> },

    /// RUN command
    Run { command: RunCommand },

    /// COPY [--chown=<user>:<group>] src... dest
    Copy { sources: Vec<String>, destination: String, chown: Option<String> },

    /// ADD [--chown=<user>:<group>] src... dest
    Add { sources: Vec<String>, destination: String, chown: Option<String> },

    /// ENV key=value ... or ENV key value
    Env { vars: Vec<(String, String)> },

    /// ARG name[=default]
    Arg { name: String, default: Option<String> },

    /// LABEL key=value ...
    Label { labels: Vec<(String, String)> },

    /// EXPOSE port[/protocol] ...
    Expose { ports: Vec<String> },

    /// WORKDIR /path
    Workdir { path: String },

    /// USER user[:group]
    User { user: String },

    /// ENTRYPOINT ["exec", "form"] or ENTRYPOINT command
    Entrypoint { command: RunCommand },

    /// CMD ["exec", "form"] or CMD command
    Cmd { command: RunCommand },

    /// SHELL ["executable", "parameters"]
    Shell { shell: Vec<String> },

    /// STOPSIGNAL signal
    Stopsignal { signal: String },
}

impl Instruction {
    /// Upper-case keyword for the instruction.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Env { .. } => "ENV",
            Instruction::Arg { .. } => "ARG",
            Instruction::Label { .. } => "LABEL",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Shell { .. } => "SHELL",
            Instruction::Stopsignal { .. } => "STOPSIGNAL",
        }
    }
}

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCommand {
    /// Shell form: RUN pip install -r requirements.txt
    Shell(String),
    /// Exec form: CMD ["python", "main.py"]
    Exec(Vec<String>),
}

impl RunCommand {
    /// Builds the argv, wrapping shell form in `shell`.
    pub fn to_argv(&self, shell: &[String]) -> Vec<String> {
        match self {
            RunCommand::Shell(cmd) => {
                let mut argv = shell.to_vec();
                argv.push(cmd.clone());
                argv
            }
            RunCommand::Exec(args) => args.clone(),
        }
    }

    /// True if there is nothing to run.
    pub fn is_empty(&self) -> bool {
        match self {
            RunCommand::Shell(cmd) => cmd.trim().is_empty(),
            RunCommand::Exec(args) => args.is_empty() || args[0].is_empty(),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(cmd) => write!(f, "{}", cmd),
            RunCommand::Exec(args) => write!(f, "{:?}", args),
        }
    }
}

/// Dockerfile parse error.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses a Dockerfile from a string.
///
/// # Examples
/// ```
/// use strata_core::builder::parser::parse_dockerfile;
///
/// let dockerfile = r#"
/// FROM python:3.8-slim
/// WORKDIR /app
/// COPY requirements.txt .
/// RUN pip install -r requirements.txt
/// COPY . .
/// CMD ["python", "main.py"]
/// "#;
///
/// let parsed = parse_dockerfile(dockerfile).unwrap();
/// assert_eq!(parsed.steps.len(), 6);
/// assert_eq!(parsed.base_image(), "python:3.8-slim");
/// ```
pub fn parse_dockerfile(content: &str) -> Result<Dockerfile, ParseError> {
    let mut parser = DockerfileParser::new(content);
    parser.parse()
}

/// Internal parser state.
struct DockerfileParser {
    lines: Vec<(usize, String)>, // (line_number, content)
    pos: usize,
}

impl DockerfileParser {
    fn new(content: &str) -> Self {
        Self { lines: Self::preprocess(content), pos: 0 }
    }

    /// Joins continuation lines and drops comment and blank lines.
    ///
    /// Only lines whose first non-blank character is `#` are comments; a `#`
    /// later in a line is part of the instruction (`RUN echo "#1"`).
    fn preprocess(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut current_line = String::new();
        let mut current_line_num = 0;
        let mut continuation = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-based line numbers
            let trimmed = line.trim();

            // Comment lines inside a continuation are skipped too
            if trimmed.starts_with('#') || (trimmed.is_empty() && !continuation) {
                continue;
            }

            let body = trimmed.strip_suffix('\\').unwrap_or(trimmed).trim();

            if continuation {
                if !body.is_empty() {
                    current_line.push(' ');
                    current_line.push_str(body);
                }
            } else {
                current_line_num = line_num;
                current_line = body.to_string();
            }

            continuation = trimmed.ends_with('\\');

            if !continuation && !current_line.is_empty() {
                result.push((current_line_num, std::mem::take(&mut current_line)));
            }
        }

        // Handle final line if it was a continuation
        if !current_line.is_empty() {
            result.push((current_line_num, current_line));
        }

        result
    }

    fn parse(&mut self) -> Result<Dockerfile, ParseError> {
        let mut global_args = Vec::new();
        let mut steps: Vec<BuildStep> = Vec::new();

        while self.pos < self.lines.len() {
            let (line_num, line) = self.lines[self.pos].clone();
            self.pos += 1;

            let keyword = Self::extract_instruction(&line);
            let rest = Self::extract_rest(&line);

            if steps.is_empty() {
                // Before FROM only ARG is allowed
                if keyword == "ARG" {
                    if let Instruction::Arg { name, default } = self.parse_arg(line_num, rest)? {
                        global_args.push((name, default));
                    }
                    continue;
                }
                if keyword != "FROM" {
                    return Err(ParseError {
                        line: line_num,
                        message: format!("Expected ARG or FROM, found {}", keyword),
                        hint: Some("Dockerfile must start with ARG or FROM instruction".into()),
                    });
                }
            } else if keyword == "FROM" {
                return Err(ParseError {
                    line: line_num,
                    message: "Multi-stage builds are not supported".into(),
                    hint: Some("Use a single FROM instruction".into()),
                });
            }

            let instruction = self.parse_instruction(line_num, &keyword, rest)?;
            steps.push(BuildStep {
                number: steps.len() + 1,
                line: line_num,
                text: format!("{} {}", keyword, rest).trim_end().to_string(),
                instruction,
            });
        }

        if steps.is_empty() {
            return Err(ParseError {
                line: self.lines.last().map(|(n, _)| *n).unwrap_or(1),
                message: "Dockerfile must contain a FROM instruction".into(),
                hint: None,
            });
        }

        Ok(Dockerfile { global_args, steps })
    }

    fn parse_instruction(
        &self,
        line_num: usize,
        keyword: &str,
        rest: &str,
    ) -> Result<Instruction, ParseError> {
        match keyword {
            "FROM" => self.parse_from(line_num, rest),
            "RUN" => self.parse_run(line_num, rest),
            "COPY" => self.parse_copy(line_num, rest, "COPY"),
            "ADD" => self.parse_copy(line_num, rest, "ADD"),
            "ENV" => self.parse_env(line_num, rest),
            "ARG" => self.parse_arg(line_num, rest),
            "LABEL" => self.parse_label(line_num, rest),
            "EXPOSE" => self.parse_expose(line_num, rest),
            "WORKDIR" => self.parse_single(line_num, rest, "WORKDIR", |path| Instruction::Workdir { path }),
            "USER" => self.parse_single(line_num, rest, "USER", |user| Instruction::User { user }),
            "STOPSIGNAL" => {
                self.parse_single(line_num, rest, "STOPSIGNAL", |signal| Instruction::Stopsignal { signal })
            }
            "ENTRYPOINT" => Ok(Instruction::Entrypoint { command: self.parse_command(line_num, rest)? }),
            "CMD" => Ok(Instruction::Cmd { command: self.parse_command(line_num, rest)? }),
            "SHELL" => self.parse_shell(line_num, rest),
            "HEALTHCHECK" | "VOLUME" | "ONBUILD" | "MAINTAINER" => Err(ParseError {
                line: line_num,
                message: format!("{} is not supported", keyword),
                hint: None,
            }),
            _ => Err(ParseError {
                line: line_num,
                message: format!("Unknown instruction: {}", keyword),
                hint: None,
            }),
        }
    }

    fn parse_from(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        // FROM [--platform=<platform>] <image> [AS <name>]
        let args = Self::tokenize(rest);

        let mut platform = None;
        let mut image_start = 0;

        if let Some(p) = args.first().and_then(|s| s.strip_prefix("--platform=")) {
            platform = Some(p.to_string());
            image_start = 1;
        }

        let image = args.get(image_start).ok_or_else(|| ParseError {
            line: line_num,
            message: "FROM instruction requires an image reference".into(),
            hint: Some("Usage: FROM <image>".into()),
        })?;

        // A stage name is harmless in a single-stage build; anything else is not
        match &args[image_start + 1..] {
            [] => {}
            [as_kw, _name] if as_kw.eq_ignore_ascii_case("AS") => {}
            _ => {
                return Err(ParseError {
                    line: line_num,
                    message: "Unexpected arguments after FROM image".into(),
                    hint: Some("Usage: FROM [--platform=<platform>] <image> [AS <name>]".into()),
                })
            }
        }

        Ok(Instruction::From { image: image.clone(), platform })
    }

    fn parse_run(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let command = self.parse_command(line_num, rest)?;
        if command.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "RUN instruction requires a command".into(),
                hint: Some("Usage: RUN <command> or RUN [\"executable\", \"arg1\"]".into()),
            });
        }
        Ok(Instruction::Run { command })
    }

    fn parse_command(&self, line_num: usize, rest: &str) -> Result<RunCommand, ParseError> {
        let rest = rest.trim();
        if rest.starts_with('[') {
            // Exec form: a JSON array of strings. Docker falls back to shell
            // form when the array is not valid JSON; so do we.
            if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
                return Ok(RunCommand::Exec(args));
            }
        }

        if rest.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "Command is empty".into(),
                hint: None,
            });
        }

        Ok(RunCommand::Shell(rest.to_string()))
    }

    fn parse_copy(&self, line_num: usize, rest: &str, keyword: &str) -> Result<Instruction, ParseError> {
        // COPY [--chown=<user>:<group>] <src>... <dest>
        let args = Self::tokenize(rest);
        let mut chown = None;
        let mut arg_start = 0;

        for (i, arg) in args.iter().enumerate() {
            if let Some(owner) = arg.strip_prefix("--chown=") {
                chown = Some(owner.to_string());
                arg_start = i + 1;
            } else if arg.starts_with("--from=") {
                return Err(ParseError {
                    line: line_num,
                    message: format!("{} --from is not supported", keyword),
                    hint: Some("Multi-stage builds are not supported".into()),
                });
            } else if arg.starts_with("--") {
                return Err(ParseError {
                    line: line_num,
                    message: format!("Unknown {} flag: {}", keyword, arg),
                    hint: None,
                });
            } else {
                break;
            }
        }

        let remaining: Vec<String> = if args.len() > arg_start && args[arg_start].starts_with('[') {
            // JSON form: COPY ["src", "dest"]
            let json = args[arg_start..].join(" ");
            serde_json::from_str(&json).map_err(|_| ParseError {
                line: line_num,
                message: format!("Invalid JSON array for {}", keyword),
                hint: None,
            })?
        } else {
            args[arg_start..].iter().map(|a| unquote(a)).collect()
        };

        match remaining.split_last() {
            Some((destination, sources)) if !sources.is_empty() => {
                let sources = sources.to_vec();
                let destination = destination.clone();
                Ok(if keyword == "ADD" {
                    Instruction::Add { sources, destination, chown }
                } else {
                    Instruction::Copy { sources, destination, chown }
                })
            }
            _ => Err(ParseError {
                line: line_num,
                message: format!("{} requires at least source and destination", keyword),
                hint: Some(format!("Usage: {} <src>... <dest>", keyword)),
            }),
        }
    }

    fn parse_env(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        // ENV key=value ... or ENV key value
        let args = Self::tokenize(rest);
        if args.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "ENV requires at least one key=value pair".into(),
                hint: None,
            });
        }

        let mut vars = Vec::new();

        if args[0].contains('=') {
            for arg in &args {
                let (key, value) = arg.split_once('=').ok_or_else(|| ParseError {
                    line: line_num,
                    message: format!("ENV expects key=value, found {}", arg),
                    hint: None,
                })?;
                vars.push((key.to_string(), unquote(value)));
            }
        } else {
            // key value format (value is the rest of the line)
            let value = rest.trim()[args[0].len()..].trim();
            if value.is_empty() {
                return Err(ParseError {
                    line: line_num,
                    message: "ENV requires a value".into(),
                    hint: None,
                });
            }
            vars.push((args[0].clone(), unquote(value)));
        }

        if let Some((key, _)) = vars.iter().find(|(k, _)| k.is_empty()) {
            return Err(ParseError {
                line: line_num,
                message: format!("ENV has an empty variable name ({:?})", key),
                hint: None,
            });
        }

        Ok(Instruction::Env { vars })
    }

    fn parse_arg(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let args = Self::tokenize(rest);
        let first = match args.as_slice() {
            [only] => only,
            _ => {
                return Err(ParseError {
                    line: line_num,
                    message: "ARG requires exactly one name".into(),
                    hint: Some("Usage: ARG <name>[=<default>]".into()),
                })
            }
        };

        let (name, default) = match first.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(unquote(default))),
            None => (first.clone(), None),
        };

        Ok(Instruction::Arg { name, default })
    }

    fn parse_label(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let mut labels = Vec::new();

        for arg in Self::tokenize(rest) {
            let (key, value) = arg.split_once('=').ok_or_else(|| ParseError {
                line: line_num,
                message: format!("LABEL expects key=value, found {}", arg),
                hint: None,
            })?;
            labels.push((unquote(key), unquote(value)));
        }

        if labels.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "LABEL requires at least one key=value pair".into(),
                hint: None,
            });
        }

        Ok(Instruction::Label { labels })
    }

    fn parse_expose(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        let ports = Self::tokenize(rest);
        if ports.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: "EXPOSE requires at least one port".into(),
                hint: Some("Usage: EXPOSE <port>[/<protocol>]".into()),
            });
        }
        // Ports may contain variables, so they are validated after expansion
        Ok(Instruction::Expose { ports })
    }

    fn parse_single(
        &self,
        line_num: usize,
        rest: &str,
        keyword: &str,
        build: impl FnOnce(String) -> Instruction,
    ) -> Result<Instruction, ParseError> {
        let value = unquote(rest.trim());
        if value.is_empty() {
            return Err(ParseError {
                line: line_num,
                message: format!("{} requires an argument", keyword),
                hint: None,
            });
        }
        Ok(build(value))
    }

    fn parse_shell(&self, line_num: usize, rest: &str) -> Result<Instruction, ParseError> {
        // SHELL ["executable", "parameters"]
        let shell = serde_json::from_str::<Vec<String>>(rest.trim())
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ParseError {
                line: line_num,
                message: "SHELL requires JSON array format".into(),
                hint: Some("Usage: SHELL [\"executable\", \"arg1\", \"arg2\"]".into()),
            })?;

        Ok(Instruction::Shell { shell })
    }

    fn extract_instruction(line: &str) -> String {
        line.split_whitespace().next().unwrap_or("").to_uppercase()
    }

    fn extract_rest(line: &str) -> &str {
        match line.split_once(char::is_whitespace) {
            Some((_, rest)) => rest.trim(),
            None => "",
        }
    }

    /// Simple tokenizer that respects quotes and JSON arrays.
    fn tokenize(s: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_json = 0;

        for c in s.chars() {
            match c {
                '"' if in_json == 0 => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                '[' if !in_quotes => {
                    in_json += 1;
                    current.push(c);
                }
                ']' if !in_quotes && in_json > 0 => {
                    in_json -= 1;
                    current.push(c);
                    if in_json == 0 {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                ' ' | '\t' if !in_quotes && in_json == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            }
        }

        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }
}

/// Strips one pair of matching surrounding quotes.
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_DOCKERFILE: &str = r#"
FROM python:3.8-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install -r requirements.txt
COPY . .
CMD ["python", "main.py"]
"#;

    #[test]
    fn test_app_dockerfile() {
        let parsed = parse_dockerfile(APP_DOCKERFILE).unwrap();
        assert_eq!(parsed.steps.len(), 6);
        assert_eq!(parsed.base_image(), "python:3.8-slim");

        let numbers: Vec<usize> = parsed.steps.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

        assert_eq!(parsed.steps[1].instruction, Instruction::Workdir { path: "/app".into() });
        assert_eq!(
            parsed.steps[2].instruction,
            Instruction::Copy {
                sources: vec!["requirements.txt".into()],
                destination: ".".into(),
                chown: None
            }
        );
        assert_eq!(
            parsed.steps[3].instruction,
            Instruction::Run {
                command: RunCommand::Shell("pip install -r requirements.txt".into())
            }
        );
        assert_eq!(
            parsed.steps[5].instruction,
            Instruction::Cmd {
                command: RunCommand::Exec(vec!["python".into(), "main.py".into()])
            }
        );
        assert_eq!(parsed.steps[3].text, "RUN pip install -r requirements.txt");
        assert_eq!(parsed.steps[3].line, 5);
    }

    #[test]
    fn test_arg_parsing() {
        let dockerfile = r#"
ARG VERSION=3.8
FROM python:${VERSION}-slim
ARG PIP_FLAGS
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.global_args, vec![("VERSION".to_string(), Some("3.8".to_string()))]);
        assert_eq!(parsed.base_image(), "python:${VERSION}-slim");
        assert_eq!(
            parsed.steps[1].instruction,
            Instruction::Arg { name: "PIP_FLAGS".into(), default: None }
        );
    }

    #[test]
    fn test_line_continuation() {
        let dockerfile = r#"
FROM alpine:3.19
RUN apk add --no-cache \
    # comment inside continuation
    nginx \
    curl
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(
            parsed.steps[1].instruction,
            Instruction::Run { command: RunCommand::Shell("apk add --no-cache nginx curl".into()) }
        );
    }

    #[test]
    fn test_hash_inside_instruction_is_kept() {
        let dockerfile = r##"
# This is a comment
FROM alpine:3.19
RUN echo "#1" > /tmp/out
        "##;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(
            parsed.steps[1].instruction,
            Instruction::Run { command: RunCommand::Shell("echo \"#1\" > /tmp/out".into()) }
        );
    }

    #[test]
    fn test_instructions_are_case_insensitive() {
        let parsed = parse_dockerfile("from alpine\nworkdir /srv\n").unwrap();
        assert_eq!(parsed.steps[1].instruction, Instruction::Workdir { path: "/srv".into() });
    }

    #[test]
    fn test_env_parsing() {
        let dockerfile = r#"
FROM alpine
ENV KEY1=value1 KEY2="two words"
ENV KEY3 value with spaces
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();

        assert_eq!(
            parsed.steps[1].instruction,
            Instruction::Env {
                vars: vec![
                    ("KEY1".into(), "value1".into()),
                    ("KEY2".into(), "two words".into())
                ]
            }
        );
        assert_eq!(
            parsed.steps[2].instruction,
            Instruction::Env { vars: vec![("KEY3".into(), "value with spaces".into())] }
        );
    }

    #[test]
    fn test_copy_flags_and_json_form() {
        let dockerfile = r#"
FROM alpine
COPY --chown=1000:1000 a.txt b.txt /dest/
COPY ["with space.txt", "/dest/"]
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(
            parsed.steps[1].instruction,
            Instruction::Copy {
                sources: vec!["a.txt".into(), "b.txt".into()],
                destination: "/dest/".into(),
                chown: Some("1000:1000".into())
            }
        );
        assert_eq!(
            parsed.steps[2].instruction,
            Instruction::Copy {
                sources: vec!["with space.txt".into()],
                destination: "/dest/".into(),
                chown: None
            }
        );
    }

    #[test]
    fn test_shell_and_entrypoint() {
        let dockerfile = r#"
FROM alpine
SHELL ["/bin/bash", "-eo", "pipefail", "-c"]
ENTRYPOINT python -u main.py
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        let shell = match &parsed.steps[1].instruction {
            Instruction::Shell { shell } => shell.clone(),
            other => panic!("Expected SHELL, got {:?}", other),
        };
        assert_eq!(shell.len(), 4);

        match &parsed.steps[2].instruction {
            Instruction::Entrypoint { command } => {
                assert_eq!(
                    command.to_argv(&shell),
                    vec!["/bin/bash", "-eo", "pipefail", "-c", "python -u main.py"]
                );
            }
            other => panic!("Expected ENTRYPOINT, got {:?}", other),
        }
    }

    #[test]
    fn test_error_no_from() {
        let err = parse_dockerfile("RUN echo hello").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("Expected ARG or FROM"));
    }

    #[test]
    fn test_error_empty_file() {
        assert!(parse_dockerfile("# only a comment\n\n").is_err());
    }

    #[test]
    fn test_error_second_from() {
        let err = parse_dockerfile("FROM alpine\nRUN true\nFROM alpine\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_error_copy_from_stage() {
        assert!(parse_dockerfile("FROM alpine\nCOPY --from=builder /a /b\n").is_err());
    }

    #[test]
    fn test_error_unknown_instruction() {
        let dockerfile = r#"
FROM alpine
INVALID instruction
        "#;
        let err = parse_dockerfile(dockerfile).unwrap_err();
        assert!(err.message.contains("Unknown instruction"));
    }

    #[test]
    fn test_error_copy_without_destination() {
        assert!(parse_dockerfile("FROM alpine\nCOPY only-one\n").is_err());
    }

    #[test]
    fn test_error_empty_run() {
        assert!(parse_dockerfile("FROM alpine\nRUN []\n").is_err());
    }
}
