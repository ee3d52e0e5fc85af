//! Pure text-edit primitives for the structured change applier.
//!
//! Region boundaries are found by balanced-brace scanning that respects
//! string, template, and comment contexts, so a brace inside a string literal
//! never terminates a function body. Every upsert is byte-idempotent:
//! re-applying the same change yields `Unchanged`.

use regex::Regex;

/// Result of a pure edit against a source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The source already contains the requested state.
    Unchanged,
    /// The edited source.
    Changed(String),
}

impl EditOutcome {
    pub fn into_text(self, original: &str) -> String {
        match self {
            Self::Unchanged => original.to_string(),
            Self::Changed(text) => text,
        }
    }
}

/// Lexer mode for brace scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Plain code; tracks local brace depth.
    Code(usize),
    LineComment,
    BlockComment,
    SingleQuote,
    DoubleQuote,
    Template,
}

/// Index of the `}` matching the `{` at `open`, or `None` if unbalanced.
///
/// Understands `//` and `/* */` comments, single/double-quoted strings, and
/// template literals including `${}` interpolation.
pub fn matching_brace(source: &str, open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }

    let mut stack: Vec<Mode> = vec![Mode::Code(0)];
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match *stack.last().expect("scanner stack never empty") {
            Mode::Code(depth) => match b {
                b'{' => {
                    *stack.last_mut().expect("scanner stack never empty") = Mode::Code(depth + 1)
                }
                b'}' => {
                    if depth == 1 && stack.len() == 1 {
                        return Some(i);
                    }
                    if depth == 1 && stack.len() > 1 {
                        // End of a template interpolation.
                        stack.pop();
                    } else {
                        *stack.last_mut().expect("scanner stack never empty") =
                            Mode::Code(depth.saturating_sub(1));
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    stack.push(Mode::LineComment);
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    stack.push(Mode::BlockComment);
                    i += 1;
                }
                b'\'' => stack.push(Mode::SingleQuote),
                b'"' => stack.push(Mode::DoubleQuote),
                b'`' => stack.push(Mode::Template),
                _ => {}
            },
            Mode::LineComment => {
                if b == b'\n' {
                    stack.pop();
                }
            }
            Mode::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    stack.pop();
                    i += 1;
                }
            }
            Mode::SingleQuote => match b {
                b'\\' => i += 1,
                b'\'' | b'\n' => {
                    stack.pop();
                }
                _ => {}
            },
            Mode::DoubleQuote => match b {
                b'\\' => i += 1,
                b'"' | b'\n' => {
                    stack.pop();
                }
                _ => {}
            },
            Mode::Template => match b {
                b'\\' => i += 1,
                b'`' => {
                    stack.pop();
                }
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    stack.push(Mode::Code(1));
                    i += 1;
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// First `{` in code context at or after `from`.
///
/// Stops at a top-level `;` (expression-bodied declarations have no block).
fn next_code_brace(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut mode = Mode::Code(0);
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match mode {
            Mode::Code(_) => match b {
                b'{' => return Some(i),
                b';' => return None,
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    mode = Mode::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    mode = Mode::BlockComment;
                    i += 1;
                }
                b'\'' => mode = Mode::SingleQuote,
                b'"' => mode = Mode::DoubleQuote,
                b'`' => mode = Mode::Template,
                _ => {}
            },
            Mode::LineComment => {
                if b == b'\n' {
                    mode = Mode::Code(0);
                }
            }
            Mode::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    mode = Mode::Code(0);
                    i += 1;
                }
            }
            Mode::SingleQuote => match b {
                b'\\' => i += 1,
                b'\'' | b'\n' => mode = Mode::Code(0),
                _ => {}
            },
            Mode::DoubleQuote => match b {
                b'\\' => i += 1,
                b'"' | b'\n' => mode = Mode::Code(0),
                _ => {}
            },
            Mode::Template => match b {
                b'\\' => i += 1,
                b'`' => mode = Mode::Code(0),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Locate the full definition region of a JavaScript function.
///
/// Supported declaration forms: `function name(`, `const/let/var name =`,
/// and class-method heads. The region runs from the declaration keyword
/// through the matching close brace (plus a trailing `;` for assignment
/// forms).
pub fn find_js_function(source: &str, name: &str) -> Option<std::ops::Range<usize>> {
    let escaped = regex::escape(name);
    let declaration = Regex::new(&format!(r"function\s+{escaped}\s*\(")).ok()?;
    let assignment = Regex::new(&format!(r"(?:const|let|var)\s+{escaped}\s*=")).ok()?;
    let method = Regex::new(&format!(
        r"(?m)^[ \t]*(?:static\s+)?(?:async\s+)?{escaped}\s*\([^)]*\)\s*\{{"
    ))
    .ok()?;

    let mut candidates: Vec<(usize, usize, bool)> = Vec::new();
    if let Some(m) = declaration.find(source) {
        candidates.push((m.start(), m.end(), false));
    }
    if let Some(m) = assignment.find(source) {
        candidates.push((m.start(), m.end(), true));
    }
    if let Some(m) = method.find(source) {
        // Method pattern already consumed the open brace; rewind to it.
        let brace = source[m.start()..m.end()].rfind('{').map(|o| m.start() + o)?;
        candidates.push((m.start(), brace, false));
    }
    let (start, search_from, assignment_form) =
        candidates.into_iter().min_by_key(|(start, _, _)| *start)?;

    match next_code_brace(source, search_from) {
        Some(open) => {
            let close = matching_brace(source, open)?;
            let mut end = close + 1;
            if assignment_form && source.as_bytes().get(end) == Some(&b';') {
                end += 1;
            }
            Some(start..end)
        }
        None if assignment_form => {
            // Expression-bodied assignment: run to the terminating semicolon.
            let rest = &source[search_from..];
            let semi = rest.find(';')?;
            Some(start..search_from + semi + 1)
        }
        None => None,
    }
}

/// Replace the named function if present, else append the definition.
pub fn upsert_js_function(source: &str, name: &str, body: &str) -> EditOutcome {
    match find_js_function(source, name) {
        Some(range) => {
            let existing = &source[range.clone()];
            if existing.trim() == body.trim() {
                return EditOutcome::Unchanged;
            }
            let mut edited = String::with_capacity(source.len() + body.len());
            edited.push_str(&source[..range.start]);
            edited.push_str(body);
            edited.push_str(&source[range.end..]);
            EditOutcome::Changed(edited)
        }
        None => EditOutcome::Changed(append_block(source, body)),
    }
}

/// True when any supported declaration form of `name` occurs in `source`.
pub fn declares_js_function(source: &str, name: &str) -> bool {
    let escaped = regex::escape(name);
    for pattern in [
        format!(r"function\s+{escaped}\s*\("),
        format!(r"const\s+{escaped}\s*="),
        format!(r"let\s+{escaped}\s*="),
        format!(r"var\s+{escaped}\s*="),
    ] {
        if Regex::new(&pattern)
            .map(|re| re.is_match(source))
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Locate the first top-level rule whose selector equals `selector` exactly
/// (modulo whitespace collapsing). At-rule blocks are skipped whole.
pub fn find_css_rule(source: &str, selector: &str) -> Option<std::ops::Range<usize>> {
    let wanted = collapse_ws(selector);
    let bytes = source.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        // Skip whitespace and comments between rules.
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match source[i + 2..].find("*/") {
                Some(off) => {
                    i = i + 2 + off + 2;
                    continue;
                }
                None => return None,
            }
        }
        if bytes[i] == b'}' {
            i += 1;
            continue;
        }

        let rule_start = i;
        let (delim, byte) = css_next_delim(source, i)?;
        if byte == b';' {
            // Statement-style at-rule such as `@import`; no block to scan.
            i = delim + 1;
            continue;
        }
        let open = delim;
        let close = matching_brace(source, open)?;
        let head = &source[rule_start..open];

        if !head.trim_start().starts_with('@') && collapse_ws(head) == wanted {
            return Some(rule_start..close + 1);
        }
        i = close + 1;
    }
    None
}

/// Replace the rule for `selector` if present at top level, else append.
pub fn upsert_css_rule(source: &str, selector: &str, block: &str) -> EditOutcome {
    match find_css_rule(source, selector) {
        Some(range) => {
            let existing = &source[range.clone()];
            if existing.trim() == block.trim() {
                return EditOutcome::Unchanged;
            }
            let mut edited = String::with_capacity(source.len() + block.len());
            edited.push_str(&source[..range.start]);
            edited.push_str(block);
            edited.push_str(&source[range.end..]);
            EditOutcome::Changed(edited)
        }
        None => EditOutcome::Changed(append_block(source, block)),
    }
}

/// True when every space-separated part of `selector` opens a rule somewhere
/// in `source` (compound selectors are checked part by part).
pub fn css_selector_present(source: &str, selector: &str) -> bool {
    for part in selector.split_whitespace() {
        if !(part.starts_with('.') || part.starts_with('#') || part.starts_with('[')) {
            return false;
        }
        let escaped = regex::escape(part);
        let pattern = format!(r"{escaped}[^{{}}]*\{{");
        match Regex::new(&pattern) {
            Ok(re) if re.is_match(source) => {}
            _ => return false,
        }
    }
    true
}

/// Insert `content` after the first occurrence of `anchor`.
///
/// The anchor is a literal substring, or a regex when `use_regex`. Fails when
/// the anchor does not occur; no silent append. Re-inserting identical
/// content at the same point is a no-op.
pub fn insert_after_anchor(
    source: &str,
    anchor: &str,
    content: &str,
    use_regex: bool,
) -> Result<EditOutcome, String> {
    let pos = if use_regex {
        let re = Regex::new(anchor).map_err(|e| format!("invalid anchor regex: {e}"))?;
        re.find(source).map(|m| m.end())
    } else {
        source.find(anchor).map(|p| p + anchor.len())
    };
    let pos = pos.ok_or_else(|| format!("anchor not found: {}", preview(anchor)))?;

    let insertion = format!("\n{content}");
    if source[pos..].starts_with(&insertion) {
        return Ok(EditOutcome::Unchanged);
    }
    let mut edited = String::with_capacity(source.len() + insertion.len());
    edited.push_str(&source[..pos]);
    edited.push_str(&insertion);
    edited.push_str(&source[pos..]);
    Ok(EditOutcome::Changed(edited))
}

/// Insert `content` before the first occurrence of `anchor`. Same contract
/// as [`insert_after_anchor`].
pub fn insert_before_anchor(
    source: &str,
    anchor: &str,
    content: &str,
    use_regex: bool,
) -> Result<EditOutcome, String> {
    let pos = if use_regex {
        let re = Regex::new(anchor).map_err(|e| format!("invalid anchor regex: {e}"))?;
        re.find(source).map(|m| m.start())
    } else {
        source.find(anchor)
    };
    let pos = pos.ok_or_else(|| format!("anchor not found: {}", preview(anchor)))?;

    let insertion = format!("{content}\n");
    if source[..pos].ends_with(&insertion) {
        return Ok(EditOutcome::Unchanged);
    }
    let mut edited = String::with_capacity(source.len() + insertion.len());
    edited.push_str(&source[..pos]);
    edited.push_str(&insertion);
    edited.push_str(&source[pos..]);
    Ok(EditOutcome::Changed(edited))
}

/// Append `content` unless `signature` already occurs (line endings
/// normalized before the check).
pub fn append_if_missing(source: &str, signature: &str, content: &str) -> EditOutcome {
    let normalized_source = source.replace("\r\n", "\n");
    let normalized_signature = signature.replace("\r\n", "\n");
    if normalized_source.contains(&normalized_signature) {
        return EditOutcome::Unchanged;
    }
    EditOutcome::Changed(append_block(source, content))
}

/// One find/replace: exact substring first, then `find` as a regex. Fails
/// when neither matches. Only the first occurrence is replaced.
pub fn apply_find_replace(source: &str, find: &str, replace: &str) -> Result<EditOutcome, String> {
    if source.contains(find) {
        let edited = source.replacen(find, replace, 1);
        if edited == source {
            return Ok(EditOutcome::Unchanged);
        }
        return Ok(EditOutcome::Changed(edited));
    }

    let re = Regex::new(find)
        .map_err(|_| format!("no literal match and not a valid regex: {}", preview(find)))?;
    if !re.is_match(source) {
        return Err(format!("no match for edit: {}", preview(find)));
    }
    let edited = re
        .replace(source, regex::NoExpand(replace))
        .into_owned();
    if edited == source {
        return Ok(EditOutcome::Unchanged);
    }
    Ok(EditOutcome::Changed(edited))
}

fn append_block(source: &str, block: &str) -> String {
    let mut out = source.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(block);
    out.push('\n');
    out
}

/// Next `{` or `;` outside comments and quoted strings.
fn css_next_delim(source: &str, from: usize) -> Option<(usize, u8)> {
    let bytes = source.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'{' | b';' => return Some((i, bytes[i])),
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let off = source[i + 2..].find("*/")?;
                i = i + 2 + off + 1;
            }
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn preview(text: &str) -> String {
    let trimmed: String = text.chars().take(50).collect();
    if trimmed.len() < text.len() {
        format!("'{trimmed}...'")
    } else {
        format!("'{trimmed}'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_JS: &str = r#"// app bootstrap
function init() {
  const greeting = "hello { not a brace }";
  render();
}

const render = () => {
  document.title = `sessions ${count({ nested: true })}`;
};

function handleSave(session) {
  if (session.id) {
    store.update(session);
  }
  return true;
}
"#;

    #[test]
    fn matching_brace_ignores_braces_in_strings_and_comments() {
        let src = "{ \"}\" /* } */ // }\n `}` }";
        let close = matching_brace(src, 0).expect("close");
        assert_eq!(close, src.len() - 1);
    }

    #[test]
    fn matching_brace_handles_template_interpolation() {
        let src = "{ `a ${ {b: '}'} } c` }";
        let close = matching_brace(src, 0).expect("close");
        assert_eq!(close, src.len() - 1);
    }

    #[test]
    fn finds_plain_function_declaration() {
        let range = find_js_function(APP_JS, "handleSave").expect("range");
        let text = &APP_JS[range];
        assert!(text.starts_with("function handleSave(session) {"));
        assert!(text.ends_with('}'));
        assert!(text.contains("store.update(session);"));
    }

    #[test]
    fn finds_arrow_assignment_including_semicolon() {
        let range = find_js_function(APP_JS, "render").expect("range");
        let text = &APP_JS[range];
        assert!(text.starts_with("const render = "));
        assert!(text.ends_with("};"));
    }

    #[test]
    fn string_braces_do_not_truncate_function_bodies() {
        let range = find_js_function(APP_JS, "init").expect("range");
        let text = &APP_JS[range];
        assert!(text.contains("render();"), "body runs past the string brace");
    }

    #[test]
    fn missing_function_is_not_found() {
        assert!(find_js_function(APP_JS, "nonexistent").is_none());
    }

    #[test]
    fn upsert_replaces_existing_function() {
        let body = "function handleSave(session) {\n  return false;\n}";
        let outcome = upsert_js_function(APP_JS, "handleSave", body);
        let EditOutcome::Changed(edited) = outcome else {
            panic!("expected change");
        };
        assert!(edited.contains("return false;"));
        assert!(!edited.contains("store.update(session);"));
        // The rest of the file is untouched.
        assert!(edited.contains("const render = () => {"));
    }

    #[test]
    fn upsert_appends_missing_function() {
        let body = "function handleClear() {\n  sessions.length = 0;\n}";
        let EditOutcome::Changed(edited) = upsert_js_function(APP_JS, "handleClear", body) else {
            panic!("expected change");
        };
        assert!(edited.ends_with("function handleClear() {\n  sessions.length = 0;\n}\n"));
    }

    #[test]
    fn upsert_function_twice_is_byte_identical() {
        let body = "function handleClear() {\n  sessions.length = 0;\n}";
        let EditOutcome::Changed(first) = upsert_js_function(APP_JS, "handleClear", body) else {
            panic!("expected change");
        };
        assert_eq!(
            upsert_js_function(&first, "handleClear", body),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn class_method_heads_are_recognized() {
        let src = "class Store {\n  update(session) {\n    this.data[session.id] = session;\n  }\n}\n";
        let range = find_js_function(src, "update").expect("range");
        let text = &src[range];
        assert!(text.starts_with("  update(session) {"));
        assert!(text.ends_with('}'));
    }

    const STYLES: &str = ".header {\n  display: flex;\n}\n\n@media (max-width: 600px) {\n  .header {\n    display: block;\n  }\n}\n\n.toast {\n  opacity: 0;\n}\n";

    #[test]
    fn css_rule_lookup_is_top_level_only() {
        let range = find_css_rule(STYLES, ".toast").expect("range");
        assert!(STYLES[range].starts_with(".toast {"));

        // The `.header` inside the media query is not top level; the first
        // top-level rule wins.
        let range = find_css_rule(STYLES, ".header").expect("range");
        assert!(STYLES[range.clone()].contains("display: flex;"));
        assert!(!STYLES[range].contains("display: block;"));
    }

    #[test]
    fn css_scan_skips_import_statements() {
        let src = "@import url(\"fonts.css\");\n\n.toast {\n  opacity: 0;\n}\n";
        let range = find_css_rule(src, ".toast").expect("range");
        assert!(src[range].starts_with(".toast {"));
    }

    #[test]
    fn css_upsert_replaces_then_noops() {
        let block = ".toast {\n  opacity: 1;\n}";
        let EditOutcome::Changed(edited) = upsert_css_rule(STYLES, ".toast", block) else {
            panic!("expected change");
        };
        assert!(edited.contains("opacity: 1;"));
        assert!(!edited.contains("opacity: 0;"));
        assert_eq!(
            upsert_css_rule(&edited, ".toast", block),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn css_upsert_appends_unknown_selector() {
        let block = ".modal {\n  display: none;\n}";
        let EditOutcome::Changed(edited) = upsert_css_rule(STYLES, ".modal", block) else {
            panic!("expected change");
        };
        assert!(edited.ends_with(".modal {\n  display: none;\n}\n"));
    }

    #[test]
    fn css_selector_presence_checks_each_compound_part() {
        assert!(css_selector_present(STYLES, ".header"));
        assert!(css_selector_present(STYLES, ".header .toast"));
        assert!(!css_selector_present(STYLES, ".missing"));
        assert!(!css_selector_present(STYLES, "header"));
    }

    #[test]
    fn insert_after_literal_anchor() {
        let src = "<body>\n<header></header>\n</body>\n";
        let outcome =
            insert_after_anchor(src, "<header>", "<button id=\"clear\">Clear</button>", false)
                .expect("insert");
        let EditOutcome::Changed(edited) = outcome else {
            panic!("expected change");
        };
        assert!(edited.contains("<header>\n<button id=\"clear\">Clear</button></header>"));
    }

    #[test]
    fn insert_after_is_idempotent_at_the_anchor() {
        let src = "<body>\n<header></header>\n</body>\n";
        let content = "<button id=\"clear\">Clear</button>";
        let EditOutcome::Changed(first) =
            insert_after_anchor(src, "<header>", content, false).expect("insert")
        else {
            panic!("expected change");
        };
        assert_eq!(
            insert_after_anchor(&first, "<header>", content, false).expect("insert"),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn insert_after_missing_anchor_fails() {
        let err = insert_after_anchor("abc", "<nav>", "x", false).unwrap_err();
        assert!(err.contains("anchor not found"));
    }

    #[test]
    fn insert_after_supports_regex_anchors() {
        let src = "const a = 1;\nconst b = 2;\n";
        let EditOutcome::Changed(edited) =
            insert_after_anchor(src, r"const b = \d;", "const c = 3;", true).expect("insert")
        else {
            panic!("expected change");
        };
        assert!(edited.contains("const b = 2;\nconst c = 3;"));
    }

    #[test]
    fn insert_before_places_content_ahead_of_anchor() {
        let src = "</body>\n";
        let EditOutcome::Changed(edited) =
            insert_before_anchor(src, "</body>", "<script src=\"app.js\"></script>", false)
                .expect("insert")
        else {
            panic!("expected change");
        };
        assert!(edited.starts_with("<script src=\"app.js\"></script>\n</body>"));
        assert_eq!(
            insert_before_anchor(&edited, "</body>", "<script src=\"app.js\"></script>", false)
                .expect("insert"),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn append_if_missing_respects_signature() {
        let src = "line one\n";
        let EditOutcome::Changed(edited) =
            append_if_missing(src, "marker()", "marker();\n// added")
        else {
            panic!("expected change");
        };
        assert!(edited.contains("marker();"));
        assert_eq!(
            append_if_missing(&edited, "marker()", "marker();\n// added"),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn append_if_missing_normalizes_line_endings() {
        let src = "top\r\nmarker()\r\n";
        assert_eq!(
            append_if_missing(src, "marker()\n", "anything"),
            EditOutcome::Unchanged
        );
    }

    #[test]
    fn find_replace_prefers_literal_then_regex() {
        let EditOutcome::Changed(edited) =
            apply_find_replace("value = 1;", "value = 1", "value = 2").expect("edit")
        else {
            panic!("expected change");
        };
        assert_eq!(edited, "value = 2;");

        let EditOutcome::Changed(edited) =
            apply_find_replace("value = 17;", r"value = \d+", "value = 2").expect("edit")
        else {
            panic!("expected change");
        };
        assert_eq!(edited, "value = 2;");
    }

    #[test]
    fn find_replace_fails_when_nothing_matches() {
        let err = apply_find_replace("abc", "zzz", "yyy").unwrap_err();
        assert!(err.contains("no match") || err.contains("not a valid regex"));
    }

    #[test]
    fn find_replace_touches_only_first_occurrence() {
        let EditOutcome::Changed(edited) =
            apply_find_replace("a a a", "a", "b").expect("edit")
        else {
            panic!("expected change");
        };
        assert_eq!(edited, "b a a");
    }
}
