// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Init script composition
//!
//! Each script phase becomes a single `gcl-init` file: strict shell
//! options, stdin closed, every source line echoed before it runs. The
//! echo carries a green `$` marker so the sink can tell commands from
//! output.

use crate::variables::Scope;

const GREEN: &str = "\u{1b}[32m";
const RESET: &str = "\u{1b}[0m";

/// Compose one runnable phase script from its source lines.
///
/// `export_vars` is set in shell mode, where variables are not injected
/// by the container runtime.
pub fn compose(lines: &[String], variables: &Scope, export_vars: bool) -> String {
    let mut script = String::new();
    script.push_str("set -eo pipefail\n");
    script.push_str("exec 0</dev/null\n");

    if export_vars {
        let mut names: Vec<&String> = variables.keys().collect();
        names.sort();
        for name in names {
            script.push_str(&format!(
                "export {name}={}\n",
                shell_quote(&variables[name])
            ));
        }
    }

    for line in lines {
        script.push_str(&format!("echo {}\n", shell_quote(&echo_text(line))));
        script.push_str(line);
        script.push('\n');
    }

    script.push_str("exit 0\n");
    script
}

/// The wrapper command that locates a shell inside the container and
/// runs the init script with it.
pub fn shell_probe(script_path: &str) -> String {
    format!(
        "if command -v bash >/dev/null 2>&1; then exec bash {p}; \
         elif command -v sh >/dev/null 2>&1; then exec sh {p}; \
         elif command -v busybox >/dev/null 2>&1; then exec busybox sh {p}; \
         else echo 'shell not found' >&2; exit 1; fi",
        p = script_path
    )
}

/// What gets echoed for one source line: the first line only, with
/// multi-line snippets flagged.
fn echo_text(line: &str) -> String {
    match line.split_once('\n') {
        None => format!("{GREEN}${RESET} {line}"),
        Some((first, _)) => {
            format!("{GREEN}${RESET} {first} (collapsed multi-line command)")
        }
    }
}

/// POSIX single-quote escaping.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
