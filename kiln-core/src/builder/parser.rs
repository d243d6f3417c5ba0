//! Build-file parsing for kiln.
//!
//! Extracts the two things the resolver needs from a Dockerfile: the ordered
//! list of ancestor image references (FROM lines, minus references to
//! multi-stage names defined earlier in the same file) and the ordered list
//! of copy-source patterns (COPY/ADD, minus `--from=` sources that come from
//! a build stage instead of the host context). ARG defaults and
//! caller-supplied build arguments substitute into both before extraction.
//!
//! Everything else in the file is the external builder's business and is
//! deliberately not validated here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Ancestor references and copy sources extracted from one build file.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// External ancestor images, in declaration order.
    pub parents: Vec<ParentImage>,
    /// Host-context copy source patterns, in declaration order.
    pub copy_sources: Vec<String>,
}

/// Identity of an ancestor image: `[registry/]name[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentImage {
    pub registry: Option<String>,
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ParentImage {
    /// Split a reference into registry, name, tag and digest parts. The
    /// registry is everything before the last `/`.
    pub fn parse(reference: &str) -> Self {
        let (name_tag, digest) = match reference.split_once('@') {
            Some((head, digest)) => (head, Some(digest.to_string())),
            None => (reference, None),
        };

        let (registry, rest) = match name_tag.rsplit_once('/') {
            Some((registry, rest)) => (Some(registry.to_string()), rest),
            None => (None, name_tag),
        };

        let (name, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) => (name.to_string(), Some(tag.to_string())),
            None => (rest.to_string(), None),
        };

        Self { registry, name, tag, digest }
    }

    /// The reference as it would be written in a build file.
    pub fn reference(&self) -> String {
        let mut out = String::new();
        if let Some(registry) = &self.registry {
            out.push_str(registry);
            out.push('/');
        }
        out.push_str(&self.name);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }
}

/// Build-file parse error with source line context.
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

/// Manifest extraction failure.
#[derive(Debug, Clone)]
pub enum ManifestError {
    /// Malformed build file.
    Parse(ParseError),
    /// A FROM reference still contains an unexpanded variable after
    /// substitution. Reported distinctly so it is never silently skipped.
    Unresolvable { line: usize, reference: String },
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ManifestError::Parse(e) => e.fmt(f),
            ManifestError::Unresolvable { line, reference } => {
                write!(f, "Line {}: unresolvable base image reference `{}`", line, reference)
            }
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<ParseError> for ManifestError {
    fn from(e: ParseError) -> Self {
        ManifestError::Parse(e)
    }
}

/// Parse a build file from a string.
pub fn parse_manifest(
    content: &str,
    build_args: &BTreeMap<String, String>,
) -> Result<Manifest, ManifestError> {
    let lines = preprocess(content);

    // ARG defaults declared in the file seed the substitution map; caller
    // build arguments override them.
    let mut args: BTreeMap<String, String> = BTreeMap::new();
    for (line_num, line) in &lines {
        if extract_instruction(line) == "ARG" {
            let tokens = extract_args(line);
            let first = tokens.first().ok_or(ParseError {
                line: *line_num,
                message: "ARG requires a name".into(),
                hint: Some("Usage: ARG <name>[=<default>]".into()),
            })?;
            if let Some((name, default)) = first.split_once('=') {
                args.insert(name.to_string(), default.to_string());
            }
        }
    }
    for (key, value) in build_args {
        args.insert(key.clone(), value.clone());
    }

    let mut parents = Vec::new();
    let mut copy_sources = Vec::new();
    let mut stage_names: Vec<String> = Vec::new();
    let mut saw_from = false;

    for (line_num, line) in &lines {
        let line_num = *line_num;
        match extract_instruction(line).as_str() {
            "FROM" => {
                saw_from = true;
                let tokens = extract_args(line);
                let mut tokens = tokens.iter().skip_while(|t| t.starts_with("--"));

                let reference = tokens.next().ok_or(ParseError {
                    line: line_num,
                    message: "FROM requires an image reference".into(),
                    hint: Some("Usage: FROM <image> [AS <name>]".into()),
                })?;
                let reference = expand(reference, &args);

                if reference.contains('$') {
                    return Err(ManifestError::Unresolvable { line: line_num, reference });
                }

                // `FROM <stage>` referencing an earlier stage is not an
                // external ancestor; neither is scratch.
                let is_stage = stage_names.iter().any(|s| s == &reference);
                if !is_stage && !reference.eq_ignore_ascii_case("scratch") {
                    parents.push(ParentImage::parse(&reference));
                }

                if let Some(keyword) = tokens.next() {
                    if keyword.eq_ignore_ascii_case("AS") {
                        let name = tokens.next().ok_or(ParseError {
                            line: line_num,
                            message: "FROM ... AS requires a stage name".into(),
                            hint: None,
                        })?;
                        stage_names.push(name.clone());
                    }
                }
            }
            "COPY" | "ADD" => {
                let instruction = extract_instruction(line);
                let tokens = extract_args(line);
                let from_stage = tokens.iter().any(|t| t.starts_with("--from="));
                let operand_tokens: Vec<String> =
                    tokens.iter().filter(|t| !t.starts_with("--")).cloned().collect();

                // Exec form arrives as a JSON array.
                let operands: Vec<String> = if operand_tokens
                    .first()
                    .map(|t| t.starts_with('['))
                    .unwrap_or(false)
                {
                    serde_json::from_str(&operand_tokens.join(" ")).map_err(|_| ParseError {
                        line: line_num,
                        message: format!("{} JSON array form is malformed", instruction),
                        hint: Some(format!("Usage: {} [\"<src>\", \"<dest>\"]", instruction)),
                    })?
                } else {
                    operand_tokens
                };

                if operands.len() < 2 {
                    return Err(ParseError {
                        line: line_num,
                        message: format!(
                            "{} requires at least source and destination",
                            instruction
                        ),
                        hint: Some(format!("Usage: {} <src>... <dest>", instruction)),
                    }
                    .into());
                }

                // Sources pulled from another build stage are not part of
                // the host context and do not feed the content hash.
                if !from_stage {
                    for source in &operands[..operands.len() - 1] {
                        copy_sources.push(expand(source, &args));
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_from {
        return Err(ParseError {
            line: 1,
            message: "build file must contain at least one FROM instruction".into(),
            hint: None,
        }
        .into());
    }

    Ok(Manifest { parents, copy_sources })
}

/// Parse a build file from disk.
pub fn parse_manifest_file(
    path: &Path,
    build_args: &BTreeMap<String, String>,
) -> Result<Manifest, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|e| ParseError {
        line: 0,
        message: format!("Failed to read build file: {}", e),
        hint: Some(format!("Check that {} exists and is readable", path.display())),
    })?;
    parse_manifest(&content, build_args)
}

/// Preprocess the build file: handle line continuations and remove comments.
fn preprocess(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current_line = String::new();
    let mut current_line_num = 0;
    let mut continuation = false;

    for (line_num, line) in content.lines().enumerate() {
        let line_num = line_num + 1;

        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let trimmed = line.trim_end();

        if trimmed.is_empty() && !continuation {
            continue;
        }

        if continuation {
            current_line.push(' ');
            current_line.push_str(trimmed.trim_end_matches('\\').trim());
        } else {
            current_line_num = line_num;
            current_line = trimmed.trim_end_matches('\\').trim().to_string();
        }

        continuation = trimmed.ends_with('\\');

        if !continuation && !current_line.is_empty() {
            result.push((current_line_num, current_line.clone()));
            current_line.clear();
        }
    }

    if !current_line.is_empty() {
        result.push((current_line_num, current_line));
    }

    result
}

fn extract_instruction(line: &str) -> String {
    line.split_whitespace().next().unwrap_or("").to_uppercase()
}

fn extract_args(line: &str) -> Vec<String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    parts.next(); // skip instruction
    match parts.next() {
        Some(rest) => rest.split_whitespace().map(str::to_string).collect(),
        None => Vec::new(),
    }
}

/// Substitute `${VAR}` and `$VAR` occurrences. Unknown variables are left
/// in place for the caller to judge.
fn expand(input: &str, args: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match args.get(&name) {
                    Some(value) if closed => out.push_str(value),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match args.get(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    out
}
