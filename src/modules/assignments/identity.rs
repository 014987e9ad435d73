use std::sync::LazyLock;

use regex::Regex;

use super::models::IdentityGuess;

const HEADER_WINDOW: usize = 10;

static PART_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_\- ]+").expect("separator pattern is valid"));
static NAME_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)name[:\-]").expect("name label pattern is valid"));
static ROLL_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(roll|registration|id)[:\-]").expect("roll label pattern is valid")
});

/// Resolve a student's identity from the upload filename, falling back to the
/// document header when the filename leaves a field unset.
pub fn resolve_identity(filename: &str, text: &str) -> IdentityGuess {
    let guess = parse_filename(filename);
    if guess.is_complete() || text.is_empty() {
        return guess;
    }
    infer_from_text(text, guess)
}

/// Split a filename such as `1024_jane_doe.pdf` or `jane-doe-1024.pdf` into
/// a name and an optional roll number.
pub fn parse_filename(filename: &str) -> IdentityGuess {
    let base = strip_extension(filename);
    let parts: Vec<&str> = PART_SEPARATOR.split(base).collect();

    let (name, roll) = if parts.len() >= 2 {
        let last = parts.len() - 1;
        if is_all_digits(parts[0]) {
            (parts[1..].join(" "), parts[0].to_string())
        } else if is_all_digits(parts[last]) {
            (parts[..last].join(" "), parts[last].to_string())
        } else {
            (parts.join(" "), String::new())
        }
    } else {
        (base.to_string(), String::new())
    };

    IdentityGuess {
        name: non_empty(name),
        roll: non_empty(roll),
    }
}

/// Fill unset identity fields from `Name:` / `Roll:` style labels in the first
/// non-empty lines of the document.
pub fn infer_from_text(text: &str, mut guess: IdentityGuess) -> IdentityGuess {
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(HEADER_WINDOW);

    for line in lines {
        if guess.name.is_none() && NAME_LABEL.is_match(line) {
            guess.name = strip_label(&NAME_LABEL, line);
        }
        if guess.roll.is_none() && ROLL_LABEL.is_match(line) {
            guess.roll = strip_label(&ROLL_LABEL, line);
        }
    }

    guess
}

fn strip_label(label: &Regex, line: &str) -> Option<String> {
    non_empty(label.replacen(line, 1, "").trim().to_string())
}

fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) => {
            let extension = &filename[idx + 1..];
            if extension.is_empty() || extension.contains('/') {
                filename
            } else {
                &filename[..idx]
            }
        }
        None => filename,
    }
}

fn is_all_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
