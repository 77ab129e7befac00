//! `${VARIABLE}` substitution across a merged instance directory.
//!
//! Idents are ASCII alphanumerics and `_`. Unknown idents and malformed
//! tokens stay verbatim; files are rewritten only when a token actually
//! resolved, so untouched files keep their mtimes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Files above this size are config-unlikely and skipped unread.
pub const DEFAULT_MAX_SUBSTITUTION_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SubstituteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What one substitution pass touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstitutionReport {
    pub scanned: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped_binary: u64,
    pub skipped_large: u64,
}

/// Walks every regular file under `root` and substitutes `${IDENT}` tokens.
/// An empty variable map short-circuits without touching the tree.
pub fn substitute_variables(
    root: &Path,
    variables: &HashMap<String, String>,
    max_file_bytes: u64,
) -> Result<SubstitutionReport, SubstituteError> {
    let mut report = SubstitutionReport::default();
    if variables.is_empty() {
        return Ok(report);
    }
    walk(root, variables, max_file_bytes, &mut report)?;
    debug!(
        scanned = report.scanned,
        updated = report.updated,
        skipped_binary = report.skipped_binary,
        skipped_large = report.skipped_large,
        "Variable substitution finished"
    );
    Ok(report)
}

fn walk(
    dir: &Path,
    variables: &HashMap<String, String>,
    max_file_bytes: u64,
    report: &mut SubstitutionReport,
) -> Result<(), SubstituteError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), variables, max_file_bytes, report)?;
        } else if file_type.is_file() {
            visit_file(&entry.path(), variables, max_file_bytes, report)?;
        }
    }
    Ok(())
}

fn visit_file(
    path: &Path,
    variables: &HashMap<String, String>,
    max_file_bytes: u64,
    report: &mut SubstitutionReport,
) -> Result<(), SubstituteError> {
    report.scanned += 1;

    if fs::metadata(path)?.len() > max_file_bytes {
        report.skipped_large += 1;
        return Ok(());
    }

    let bytes = fs::read(path)?;
    // NUL is valid UTF-8, so the binary check comes first
    if bytes.contains(&0) {
        report.skipped_binary += 1;
        return Ok(());
    }
    let Ok(text) = std::str::from_utf8(&bytes) else {
        report.skipped_binary += 1;
        return Ok(());
    };

    match replace_tokens(text, variables) {
        Some(updated) => {
            fs::write(path, updated)?;
            report.updated += 1;
        }
        None => report.unchanged += 1,
    }
    Ok(())
}

/// Returns the substituted text, or `None` when nothing resolved.
fn replace_tokens(input: &str, variables: &HashMap<String, String>) -> Option<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    let mut changed = false;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let token = after.find('}').and_then(|end| {
            let ident = &after[..end];
            let valid = !ident.is_empty()
                && ident
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_');
            valid.then_some((ident, end))
        });
        match token {
            Some((ident, end)) => {
                if let Some(value) = variables.get(ident) {
                    output.push_str(value);
                    changed = true;
                } else {
                    output.push_str("${");
                    output.push_str(ident);
                    output.push('}');
                }
                rest = &after[end + 1..];
            }
            None => {
                // malformed token; emit the opener and keep scanning
                output.push_str("${");
                rest = after;
            }
        }
    }

    if changed {
        output.push_str(rest);
        Some(output)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case("motd=${MOTD}", &[("MOTD", "Welcome")], Some("motd=Welcome"))]
    #[case("${A}${B}", &[("A", "1"), ("B", "2")], Some("12"))]
    #[case("port=${PORT} name=${NAME}", &[("PORT", "25565")], Some("port=25565 name=${NAME}"))]
    #[case("$${HOST}", &[("HOST", "h")], Some("$h"))]
    #[case("${OUTER${INNER}}", &[("INNER", "x")], Some("${OUTERx}"))]
    #[case("no tokens here", &[("A", "1")], None)]
    #[case("${UNKNOWN}", &[("A", "1")], None)]
    #[case("${not-an-ident}", &[("not-an-ident", "v")], None)]
    #[case("${}", &[("A", "1")], None)]
    #[case("dangling ${OPEN", &[("OPEN", "v")], None)]
    fn token_scanner_cases(
        #[case] input: &str,
        #[case] pairs: &[(&str, &str)],
        #[case] expected: Option<&str>,
    ) {
        let result = replace_tokens(input, &vars(pairs));
        assert_eq!(result.as_deref(), expected);
    }

    #[test]
    fn substitutes_across_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config/deep")).unwrap();
        fs::write(dir.path().join("server.properties"), "motd=${MOTD}").unwrap();
        fs::write(dir.path().join("config/deep/app.yml"), "name: ${NAME}").unwrap();
        fs::write(dir.path().join("README.txt"), "static text").unwrap();

        let report = substitute_variables(
            dir.path(),
            &vars(&[("MOTD", "Hi"), ("NAME", "lobby-1")]),
            DEFAULT_MAX_SUBSTITUTION_BYTES,
        )
        .unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("server.properties")).unwrap(),
            "motd=Hi"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("config/deep/app.yml")).unwrap(),
            "name: lobby-1"
        );
    }

    #[test]
    fn binary_and_oversized_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("server.jar"), b"PK\x00\x03${X}").unwrap();
        fs::write(dir.path().join("invalid.dat"), [0xff, 0xfe, b'$', b'{']).unwrap();
        fs::write(dir.path().join("world.dat"), "${X}".repeat(100)).unwrap();

        let report =
            substitute_variables(dir.path(), &vars(&[("X", "y")]), 16).unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.skipped_binary, 2);
        assert_eq!(report.skipped_large, 1);
        assert_eq!(report.updated, 0);
        // skipped files keep their bytes
        assert_eq!(
            fs::read(dir.path().join("server.jar")).unwrap(),
            b"PK\x00\x03${X}"
        );
    }

    #[test]
    fn empty_variable_map_short_circuits() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "${A}").unwrap();

        let report = substitute_variables(
            dir.path(),
            &HashMap::new(),
            DEFAULT_MAX_SUBSTITUTION_BYTES,
        )
        .unwrap();

        assert_eq!(report, SubstitutionReport::default());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "${A}");
    }

    #[test]
    fn unresolved_files_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "${UNKNOWN} stays").unwrap();

        let report = substitute_variables(
            dir.path(),
            &vars(&[("OTHER", "v")]),
            DEFAULT_MAX_SUBSTITUTION_BYTES,
        )
        .unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "${UNKNOWN} stays");
    }

    #[cfg(unix)]
    #[test]
    fn rewritten_files_keep_their_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("start.sh");
        fs::write(&path, "#!/bin/sh\necho ${NAME}\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        substitute_variables(
            dir.path(),
            &vars(&[("NAME", "lobby")]),
            DEFAULT_MAX_SUBSTITUTION_BYTES,
        )
        .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "#!/bin/sh\necho lobby\n"
        );
    }
}
