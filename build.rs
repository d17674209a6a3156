use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees the lint gate covers.
const SOURCE_DIRS: [&str; 5] = ["design", "model", "cli", "tests", "benches"];

/// Collects matching lines from one file, skipping comments and string
/// literals when asked to.
struct LintCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    skip_comments_and_strings: bool,
}

impl LintCollector {
    fn new(file_path: &Path, skip_comments_and_strings: bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_comments_and_strings,
        }
    }

    fn error_message(&self, what: &str, advice: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {what} in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {advice}\n"));
        Some(error_msg)
    }
}

impl Sink for LintCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments_and_strings {
            let trimmed = line_text.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with("/*") {
                return Ok(true);
            }
            // Odd segments between quotes are string contents.
            let quoted = line_text
                .split('"')
                .enumerate()
                .any(|(i, part)| i % 2 == 1 && part.contains('_'));
            if quoted {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan(
        r"\b(_[a-zA-Z0-9_]+)\b",
        true,
        "underscore-prefixed identifiers",
        "Underscore-prefixed names are not allowed. Use the binding or remove it.",
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = scan(
        r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        false,
        "#[allow(dead_code)] attributes",
        "#[allow(dead_code)] is not allowed. Use the code or remove it.",
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(
    pattern: &str,
    skip_comments_and_strings: bool,
    what: &str,
    advice: &str,
) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = LintCollector::new(&path, skip_comments_and_strings);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.error_message(what, advice) {
            return Err(error_message.into());
        }
    }
    Ok(())
}
