// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{sha256, CrashBase, EngineId, Fingerprint, LangId, ParseError};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

const TESTCASE_NULL: &str = "==??==";
const HEX_NULL: &str = "0x??";
const DEC_NULL: &str = "??";
const THREAD_NULL: &str = "thread T?";

lazy_static! {
    static ref LIBFUZZER_HEADER: Regex = Regex::new(r"^==[0-9]+==ERROR: .*$").unwrap();
    static ref JAZZER_HEADER: Regex = Regex::new(r"^== Java Exception: .*$").unwrap();
    static ref CARGO_FUZZ_HEADER: Regex =
        Regex::new(r"^thread '.*' panicked at '.*', .*$").unwrap();
    static ref ATHERIS_HEADER: Regex =
        Regex::new(r"^\s*=== Uncaught Python exception: ===$").unwrap();
    static ref GO_PANIC_BRIEF: Regex = Regex::new(r"(?m)^panic: (.+)$").unwrap();
    static ref CARGO_FUZZ_BRIEF: Regex =
        Regex::new(r"(?m)^thread '.+' panicked at '(.+)', ").unwrap();
    static ref ATHERIS_BRIEF: Regex = Regex::new(
        r"=== Uncaught Python exception: ===\s+([^\r\n]+)\s+Traceback \(most recent call last\):"
    )
    .unwrap();
    static ref JAZZER_BRIEF: Regex = Regex::new(r"(?m)^== Java Exception: (.+)$").unwrap();
    static ref SUMMARY_BRIEF: Regex = Regex::new(r"(?m)^SUMMARY: (.+)$").unwrap();
    static ref TESTCASE_ID: Regex = Regex::new(r"(?i)==\d+==").unwrap();
    static ref HEX_NUMBER: Regex = Regex::new(r"(?i)([^\w+])0x[0-9a-f]+").unwrap();
    static ref DEC_NUMBER: Regex = Regex::new(r"(?i)(\s)\d+").unwrap();
    static ref THREAD_ID: Regex = Regex::new(r"(?i)thread T\d+").unwrap();
    static ref ATHERIS_NUMBERS: Regex = Regex::new(r"0x[0-9a-f]+|[0-9]+").unwrap();
}

pub(crate) fn parse_crash(
    engine: EngineId,
    _lang: LangId,
    crash: &serde_json::Value,
) -> Result<Fingerprint, ParseError> {
    if !matches!(
        engine,
        EngineId::Libfuzzer
            | EngineId::Jazzer
            | EngineId::Atheris
            | EngineId::CargoFuzz
            | EngineId::GoFuzzLibfuzzer
    ) {
        return Err(ParseError::EngineUnsupported(engine));
    }

    let crash = CrashBase::from_value(crash)?;
    let stacktrace = read_stacktrace(&crash.output, engine);
    let brief = read_brief(&stacktrace, engine);

    let canonical = match engine {
        EngineId::Atheris => clean_atheris_output(&stacktrace),
        _ => clean_generic_output(&stacktrace),
    };

    Ok(Fingerprint {
        brief,
        unique_hash: sha256::digest(canonical),
    })
}

// Lines keep their original terminators while windowing; the kept lines are
// then rejoined with a single '\n'. The doubled interior newlines that
// produces are part of the canonical form and must not be "fixed".

fn read_stacktrace(output: &str, engine: EngineId) -> String {
    match engine {
        EngineId::Libfuzzer => read_libfuzzer_stacktrace(output),
        EngineId::GoFuzzLibfuzzer => read_go_fuzz_stacktrace(output),
        EngineId::CargoFuzz => read_windowed_stacktrace(output, &CARGO_FUZZ_HEADER),
        EngineId::Atheris => read_windowed_stacktrace(output, &ATHERIS_HEADER),
        EngineId::Jazzer => read_jazzer_stacktrace(output),
        _ => unreachable!("engine checked by parse_crash"),
    }
}

/// The line without its trailing '\n', so that `$` in the header patterns
/// anchors before the terminator.
fn line_body(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

fn is_separator(line: &str) -> bool {
    line.contains("=========") || line.contains("== ERROR: ")
}

fn read_libfuzzer_stacktrace(output: &str) -> String {
    let mut in_stacktrace = false;
    let mut kept = Vec::new();
    for line in output.split_inclusive('\n') {
        if !in_stacktrace {
            if LIBFUZZER_HEADER.is_match(line_body(line)) {
                in_stacktrace = true;
                kept.push(line);
            }
        } else {
            kept.push(line);
            if line.starts_with("SUMMARY: ") {
                break;
            }
        }
    }
    kept.join("\n")
}

fn read_jazzer_stacktrace(output: &str) -> String {
    let mut in_stacktrace = false;
    let mut kept = Vec::new();
    for line in output.split_inclusive('\n') {
        if !in_stacktrace {
            if JAZZER_HEADER.is_match(line_body(line)) {
                in_stacktrace = true;
                kept.push(line);
            }
        } else {
            if line.starts_with("DEDUP_TOKEN:") {
                break;
            }
            kept.push(line);
        }
    }
    kept.join("\n")
}

/// cargo-fuzz and atheris share the same windowing: start at the header,
/// stop before the libFuzzer separator.
fn read_windowed_stacktrace(output: &str, header: &Regex) -> String {
    let mut in_stacktrace = false;
    let mut kept = Vec::new();
    for line in output.split_inclusive('\n') {
        if !in_stacktrace {
            if header.is_match(line_body(line)) {
                in_stacktrace = true;
                kept.push(line);
            }
        } else {
            if is_separator(line) {
                break;
            }
            kept.push(line);
        }
    }
    kept.join("\n")
}

/// The Go runtime may panic again while unwinding; only the last panic block
/// is retained.
fn read_go_fuzz_stacktrace(output: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in output.split_inclusive('\n') {
        if line.starts_with("panic: ") {
            kept = vec![line];
        } else {
            kept.push(line);
        }
    }

    if let Some(pos) = kept.iter().position(|line| is_separator(line)) {
        kept.truncate(pos);
    }

    kept.join("\n")
}

fn read_brief(stacktrace: &str, engine: EngineId) -> Option<String> {
    let engine_match = match engine {
        EngineId::GoFuzzLibfuzzer => GO_PANIC_BRIEF.captures(stacktrace),
        EngineId::CargoFuzz => CARGO_FUZZ_BRIEF.captures(stacktrace),
        EngineId::Atheris => ATHERIS_BRIEF.captures(stacktrace),
        EngineId::Jazzer => JAZZER_BRIEF.captures(stacktrace),
        _ => None,
    };

    let captures = engine_match.or_else(|| SUMMARY_BRIEF.captures(stacktrace))?;
    Some(captures[1].trim().to_string())
}

/// Windows the log to the llvm portion: everything after the `Running: `
/// line, through the end of the `SUMMARY: ` line. No summary means an empty
/// window. A summary line without a trailing newline loses its final
/// character; stored hashes depend on that exact slice.
fn truncate_llvm_log(text: &str) -> &str {
    let start = match find_end(text, "Running: ", 0) {
        None => 0,
        Some(run_end) => match find_end(text, "\n", run_end) {
            Some(line_end) => line_end,
            None => return "",
        },
    };

    let end = match find_end(text, "SUMMARY: ", start) {
        None => return "",
        Some(summary_end) => match find_end(text, "\n", summary_end) {
            Some(line_end) => line_end,
            None => text.len() - text.chars().last().map_or(0, char::len_utf8),
        },
    };

    &text[start..end]
}

fn find_end(text: &str, needle: &str, from: usize) -> Option<usize> {
    text[from..].find(needle).map(|pos| from + pos + needle.len())
}

/// Scrubs run-variant tokens out of the windowed log. The substitution order
/// is a compatibility contract: hex scrubbing runs before decimal scrubbing,
/// and decimal scrubbing must not touch the leading zero of a `0x` token.
fn clean_generic_output(output: &str) -> String {
    let cleaned = truncate_llvm_log(output);
    let cleaned = TESTCASE_ID.replace_all(cleaned, TESTCASE_NULL);
    let cleaned = HEX_NUMBER.replace_all(&cleaned, format!("${{1}}{HEX_NULL}").as_str());
    let cleaned = scrub_decimals(&cleaned);
    THREAD_ID.replace_all(&cleaned, THREAD_NULL).into_owned()
}

/// Equivalent of `(\s)(?!0x)\d+`: the regex crate has no lookahead, so the
/// 0x-token guard lives in the replacer.
fn scrub_decimals(text: &str) -> String {
    DEC_NUMBER
        .replace_all(text, |caps: &Captures| {
            let whole = caps.get(0).unwrap();
            let digits = &text[whole.start() + caps[1].len()..];
            let mut chars = digits.chars();
            if chars.next() == Some('0') && matches!(chars.next(), Some('x') | Some('X')) {
                whole.as_str().to_string()
            } else {
                format!("{}{}", &caps[1], DEC_NULL)
            }
        })
        .into_owned()
}

/// Atheris tracebacks indent source locations and code; indented lines are
/// kept verbatim, all numbers are stripped from the rest.
fn clean_atheris_output(text: &str) -> String {
    split_lines(text)
        .map(|line| {
            if line.starts_with(' ') {
                line.to_string()
            } else {
                ATHERIS_NUMBERS.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.split('\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_crash;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn crash_value(output: &str) -> serde_json::Value {
        json!({
            "type": "crash",
            "input": "AA==",
            "output": output,
            "reproduced": true,
        })
    }

    #[test]
    fn test_libfuzzer_asan_report() {
        let output = concat!(
            "==12345==ERROR: AddressSanitizer: heap-buffer-overflow on address 0xdeadbeef\n",
            "    #0 0x401abc in foo /src/a.c:10:5\n",
            "    #1 0x401def in main /src/a.c:20:3\n",
            "SUMMARY: AddressSanitizer: heap-buffer-overflow /src/a.c:10:5 in foo\n",
        );

        let stacktrace = read_stacktrace(output, EngineId::Libfuzzer);
        assert_eq!(
            stacktrace,
            concat!(
                "==12345==ERROR: AddressSanitizer: heap-buffer-overflow on address 0xdeadbeef\n",
                "\n    #0 0x401abc in foo /src/a.c:10:5\n",
                "\n    #1 0x401def in main /src/a.c:20:3\n",
                "\nSUMMARY: AddressSanitizer: heap-buffer-overflow /src/a.c:10:5 in foo\n",
            )
        );

        let canonical = clean_generic_output(&stacktrace);
        let expected_canonical = concat!(
            "==??==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x??\n",
            "\n    #0 0x?? in foo /src/a.c:10:5\n",
            "\n    #1 0x?? in main /src/a.c:20:3\n",
            "\nSUMMARY: AddressSanitizer: heap-buffer-overflow /src/a.c:10:5 in foo\n",
        );
        assert_eq!(canonical, expected_canonical);

        let fingerprint = parse_crash(EngineId::Libfuzzer, LangId::Cpp, &crash_value(output))
            .unwrap();
        assert_eq!(
            fingerprint.brief.as_deref(),
            Some("AddressSanitizer: heap-buffer-overflow /src/a.c:10:5 in foo")
        );
        assert_eq!(fingerprint.unique_hash, sha256::digest(expected_canonical));
    }

    #[test]
    fn test_libfuzzer_ignores_noise_before_header() {
        let output = "\
INFO: Seed: 1337\n\
Running: ./crash-min\n\
stats: 12 exec\n\
thread T3 crashed\n\
==5==ABORTING\n\
SUMMARY: libFuzzer: deadly signal\n\
Done 1 runs\n";

        // no ERROR header: nothing is extracted, the canonical text is empty
        let stacktrace = read_stacktrace(output, EngineId::Libfuzzer);
        assert_eq!(stacktrace, "");

        // the scrubbing rules, exercised on the raw log
        let canonical = clean_generic_output(output);
        assert_eq!(
            canonical,
            "stats: ?? exec\nthread T? crashed\n==??==ABORTING\nSUMMARY: libFuzzer: deadly signal\n"
        );
    }

    #[test]
    fn test_decimal_scrub_skips_hex_tokens() {
        assert_eq!(scrub_decimals(" 12 then 0x41"), " ?? then 0x41");
        assert_eq!(scrub_decimals("pc 0x7ffd sp 0x7ffe"), "pc 0x7ffd sp 0x7ffe");
        assert_eq!(scrub_decimals("exit code 77"), "exit code ??");
        assert_eq!(scrub_decimals("rc:\t0X1F"), "rc:\t0X1F");
        assert_eq!(scrub_decimals("len 00x"), "len ??x");
        assert_eq!(scrub_decimals("#0 frame"), "#0 frame");
    }

    #[test]
    fn test_hex_scrub_preserves_leading_character() {
        let cleaned = HEX_NUMBER.replace_all("address 0xDEAD, (0x1f)", "${1}0x??");
        assert_eq!(cleaned, "address 0x??, (0x??)");
    }

    #[test]
    fn test_cargo_fuzz_panic() {
        let output = "\
thread '<unnamed>' panicked at 'attempt to subtract with overflow', src/main.rs:10:21\n\
note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace\n\
==================================================================\n\
== ERROR: libFuzzer: deadly signal\n";

        let stacktrace = read_stacktrace(output, EngineId::CargoFuzz);
        assert_eq!(
            stacktrace,
            "\
thread '<unnamed>' panicked at 'attempt to subtract with overflow', src/main.rs:10:21\n\
\nnote: run with `RUST_BACKTRACE=1` environment variable to display a backtrace\n"
        );

        let fingerprint =
            parse_crash(EngineId::CargoFuzz, LangId::Rust, &crash_value(output)).unwrap();
        assert_eq!(
            fingerprint.brief.as_deref(),
            Some("attempt to subtract with overflow")
        );
        // no Running:/SUMMARY: window in cargo-fuzz output, so the canonical
        // text is empty; preserved for hash compatibility
        assert_eq!(fingerprint.unique_hash, sha256::digest(""));
    }

    #[test]
    fn test_atheris_exception() {
        let output = concat!(
            " === Uncaught Python exception: ===\n",
            "ZeroDivisionError: division by zero\n",
            "Traceback (most recent call last):\n",
            "  File \"/x.py\", line 15, in TestOneInput\n",
            "    c = a / (b - 30)\n",
        );

        let stacktrace = read_stacktrace(output, EngineId::Atheris);
        let canonical = clean_atheris_output(&stacktrace);
        assert_eq!(
            canonical,
            concat!(
                " === Uncaught Python exception: ===\n",
                "\nZeroDivisionError: division by zero\n",
                "\nTraceback (most recent call last):\n",
                "\n  File \"/x.py\", line 15, in TestOneInput\n",
                "\n    c = a / (b - 30)",
            )
        );

        let fingerprint =
            parse_crash(EngineId::Atheris, LangId::Python, &crash_value(output)).unwrap();
        assert_eq!(
            fingerprint.brief.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert_eq!(fingerprint.unique_hash, sha256::digest(canonical));
    }

    #[test]
    fn test_atheris_strips_numbers_from_unindented_lines() {
        let text = "error at 0xdead42 attempt 7\n  kept 0x1 and 2";
        assert_eq!(
            clean_atheris_output(text),
            "error at  attempt \n  kept 0x1 and 2"
        );
    }

    #[test]
    fn test_go_fuzz_keeps_last_panic_block() {
        let output = "\
panic: runtime error: integer divide by zero\n\
goroutine 17 [running]:\n\
main.divide(...)\n\
panic: kek\n\
goroutine 18 [running]:\n\
main.divide2(...)\n\
==1234== ERROR: libFuzzer: deadly signal\n";

        let stacktrace = read_stacktrace(output, EngineId::GoFuzzLibfuzzer);
        assert_eq!(
            stacktrace,
            "panic: kek\n\ngoroutine 18 [running]:\n\nmain.divide2(...)\n"
        );

        let fingerprint =
            parse_crash(EngineId::GoFuzzLibfuzzer, LangId::Go, &crash_value(output)).unwrap();
        assert_eq!(fingerprint.brief.as_deref(), Some("kek"));
    }

    #[test]
    fn test_jazzer_stops_before_dedup_token() {
        let output = "\
== Java Exception: java.lang.ArithmeticException: / by zero\n\
\tat ExampleFuzzer.fuzzerTestOneInput(ExampleFuzzer.java:13)\n\
DEDUP_TOKEN: 123abc\n\
== libFuzzer crashing input ==\n";

        let stacktrace = read_stacktrace(output, EngineId::Jazzer);
        assert_eq!(
            stacktrace,
            "\
== Java Exception: java.lang.ArithmeticException: / by zero\n\
\n\tat ExampleFuzzer.fuzzerTestOneInput(ExampleFuzzer.java:13)\n"
        );

        let fingerprint =
            parse_crash(EngineId::Jazzer, LangId::Java, &crash_value(output)).unwrap();
        assert_eq!(
            fingerprint.brief.as_deref(),
            Some("java.lang.ArithmeticException: / by zero")
        );
    }

    #[test]
    fn test_truncate_llvm_log_windowing() {
        let log = "\
INFO: Seed: 111\n\
Running: /corpus/crash-abc\n\
stats: 12 exec\n\
SUMMARY: libFuzzer: deadly signal\n\
Done 1 runs\n";
        assert_eq!(
            truncate_llvm_log(log),
            "stats: 12 exec\nSUMMARY: libFuzzer: deadly signal\n"
        );

        assert_eq!(truncate_llvm_log("no summary here\n"), "");
        assert_eq!(
            truncate_llvm_log("SUMMARY: no trailing newline"),
            "SUMMARY: no trailing newlin"
        );
    }

    #[test]
    fn test_parse_is_deterministic() {
        let output = concat!(
            "==1==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000\n",
            "    #0 0x55e92bb2 in parse bin.c:42\n",
            "SUMMARY: AddressSanitizer: SEGV bin.c:42 in parse\n",
        );
        let crash = crash_value(output);

        let first = parse_crash(EngineId::Libfuzzer, LangId::Cpp, &crash).unwrap();
        let second = parse_crash(EngineId::Libfuzzer, LangId::Cpp, &crash).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.unique_hash.len(), 64);
    }

    #[test]
    fn test_unsupported_engines_rejected() {
        let crash = crash_value("");
        assert!(matches!(
            parse_crash(EngineId::SharpfuzzLibfuzzer, LangId::Cpp, &crash),
            Err(ParseError::EngineUnsupported(EngineId::SharpfuzzLibfuzzer))
        ));
    }
}
