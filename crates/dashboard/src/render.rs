//! Turns untrusted advisory text into a restricted node tree.
//!
//! Input without angle brackets is treated as markdown-ish text (bold spans,
//! paragraphs, bullet runs).  Anything else goes through two stages:
//!
//! 1. [`sanitize`] rewrites the markup as a string: `script`/`style` elements
//!    are removed with their content, tags outside [`ALLOWED_TAGS`] are
//!    unwrapped (their text survives), and every attribute is discarded.
//! 2. The sanitized markup is parsed into a tree and re-filtered against the
//!    allow-list.  Any element that still is not allowed at this point is
//!    dropped together with its subtree; `b`/`i` become `strong`/`em`.
//!
//! Neither stage can fail.  Unparseable input degrades to text or nothing.

use serde::Serialize;

/// Tags allowed through sanitization (before `b`/`i` re-mapping).
pub const ALLOWED_TAGS: &[&str] = &["p", "ul", "ol", "li", "strong", "em", "b", "i", "br"];

/// Elements whose content is removed together with the tag.
const RAW_TEXT_TAGS: &[&str] = &["script", "style"];

// ---------------------------------------------------------------------------
// Output tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    P,
    Ul,
    Ol,
    Li,
    Strong,
    Em,
    Br,
}

impl Tag {
    /// Resolve an allow-listed tag name, applying `b → strong` and `i → em`.
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "p" => Some(Self::P),
            "ul" => Some(Self::Ul),
            "ol" => Some(Self::Ol),
            "li" => Some(Self::Li),
            "strong" | "b" => Some(Self::Strong),
            "em" | "i" => Some(Self::Em),
            "br" => Some(Self::Br),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P => "p",
            Self::Ul => "ul",
            Self::Ol => "ol",
            Self::Li => "li",
            Self::Strong => "strong",
            Self::Em => "em",
            Self::Br => "br",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Text { text: String },
    Element { tag: Tag, children: Vec<Node> },
}

impl Node {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    pub fn element(tag: Tag, children: Vec<Node>) -> Self {
        Self::Element { tag, children }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Render an untrusted advisory string into an allow-listed node tree.
pub fn render(raw: &str) -> Vec<Node> {
    if raw.contains(|c: char| c == '<' || c == '>') {
        filter(parse(&sanitize(raw)))
    } else {
        render_plain(raw)
    }
}

/// Serialize a rendered tree back to markup.  Text is escaped, so the result
/// only ever contains allow-listed, attribute-free tags.
pub fn to_html(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_html(nodes, &mut out);
    out
}

fn write_html(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text { text } => escape_into(text, out),
            Node::Element { tag: Tag::Br, .. } => out.push_str("<br>"),
            Node::Element { tag, children } => {
                out.push('<');
                out.push_str(tag.as_str());
                out.push('>');
                write_html(children, out);
                out.push_str("</");
                out.push_str(tag.as_str());
                out.push('>');
            }
        }
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

// ---------------------------------------------------------------------------
// Plain / markdown-ish text
// ---------------------------------------------------------------------------

fn render_plain(raw: &str) -> Vec<Node> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut list: Vec<Node> = Vec::new();

    for line in raw.lines() {
        if let Some(item) = bullet_item(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            if !item.is_empty() {
                list.push(Node::element(Tag::Li, inline(item)));
            }
            continue;
        }
        flush_list(&mut list, &mut blocks);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
        } else {
            paragraph.push(trimmed);
        }
    }
    flush_paragraph(&mut paragraph, &mut blocks);
    flush_list(&mut list, &mut blocks);

    blocks
}

/// `"  - item"` / `"* item"` → `Some("item")`.  The marker must be followed by
/// whitespace, so a line opening with `**bold**` is not a bullet.
fn bullet_item(line: &str) -> Option<&str> {
    let rest = line.trim_start();
    let after = rest.strip_prefix('*').or_else(|| rest.strip_prefix('-'))?;
    let item = after.trim_start();
    if item.len() == after.len() && !after.is_empty() {
        return None;
    }
    Some(item.trim_end())
}

fn flush_paragraph(lines: &mut Vec<&str>, blocks: &mut Vec<Node>) {
    if lines.is_empty() {
        return;
    }
    let mut children = Vec::new();
    for (i, line) in lines.drain(..).enumerate() {
        if i > 0 {
            children.push(Node::element(Tag::Br, Vec::new()));
        }
        children.extend(inline(line));
    }
    blocks.push(Node::element(Tag::P, children));
}

fn flush_list(items: &mut Vec<Node>, blocks: &mut Vec<Node>) {
    if !items.is_empty() {
        blocks.push(Node::element(Tag::Ul, std::mem::take(items)));
    }
}

/// Convert `**bold**` spans (non-greedy, at least one character) to strong.
fn inline(text: &str) -> Vec<Node> {
    let mut out = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("**") {
        let inner_start = start + 2;
        let Some(first) = rest[inner_start..].chars().next() else {
            break;
        };
        let search_from = inner_start + first.len_utf8();
        let Some(rel) = rest[search_from..].find("**") else {
            break;
        };
        let end = search_from + rel;

        push_text(&mut out, &rest[..start]);
        out.push(Node::element(
            Tag::Strong,
            vec![Node::text(&rest[inner_start..end])],
        ));
        rest = &rest[end + 2..];
    }
    push_text(&mut out, rest);
    out
}

fn push_text(out: &mut Vec<Node>, s: &str) {
    if !s.is_empty() {
        out.push(Node::text(s));
    }
}

// ---------------------------------------------------------------------------
// Stage 1: string-level sanitization
// ---------------------------------------------------------------------------

struct TagToken {
    name: String,
    closing: bool,
    /// Byte offset just past the closing `>`.
    end: usize,
}

/// Rewrite untrusted markup so that only bare allow-listed tags remain.
/// Stray angle brackets are escaped so the parser sees them as text.
pub fn sanitize(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => {
                if let Some(tag) = scan_tag(raw, i) {
                    if !tag.closing && RAW_TEXT_TAGS.contains(&tag.name.as_str()) {
                        i = skip_raw_text(raw, tag.end, &tag.name);
                        continue;
                    }
                    if ALLOWED_TAGS.contains(&tag.name.as_str()) {
                        out.push('<');
                        if tag.closing {
                            out.push('/');
                        }
                        out.push_str(&tag.name);
                        out.push('>');
                    }
                    i = tag.end;
                } else if let Some(end) = skip_declaration(raw, i) {
                    i = end;
                } else {
                    out.push_str("&lt;");
                    i += 1;
                }
            }
            b'>' => {
                out.push_str("&gt;");
                i += 1;
            }
            _ => {
                let next = raw[i..]
                    .find(|c: char| c == '<' || c == '>')
                    .map_or(raw.len(), |n| i + n);
                out.push_str(&raw[i..next]);
                i = next;
            }
        }
    }
    out
}

/// Scan a start or end tag at `start` (which must point at `<`).  The name is
/// lowercased and attributes, `on*` handlers included, are skipped entirely.
/// Quoted attribute values may contain `>`.  An unterminated tag swallows the
/// rest of the input.
fn scan_tag(s: &str, start: usize) -> Option<TagToken> {
    let bytes = s.as_bytes();
    let mut pos = start + 1;

    let closing = bytes.get(pos) == Some(&b'/');
    if closing {
        pos += 1;
    }

    if !bytes.get(pos)?.is_ascii_alphabetic() {
        return None;
    }
    let name_start = pos;
    while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'-') {
        pos += 1;
    }
    let name = s[name_start..pos].to_ascii_lowercase();

    let mut quote: Option<u8> = None;
    while pos < bytes.len() {
        let b = bytes[pos];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => {
                return Some(TagToken {
                    name,
                    closing,
                    end: pos + 1,
                });
            }
            None => {}
        }
        pos += 1;
    }

    Some(TagToken {
        name,
        closing,
        end: bytes.len(),
    })
}

/// Skip past the matching `</name ...>`; an unclosed element runs to the end.
fn skip_raw_text(s: &str, from: usize, name: &str) -> usize {
    let lower = s[from..].to_ascii_lowercase();
    let needle = format!("</{name}");
    let mut search = 0;

    while let Some(rel) = lower[search..].find(&needle) {
        let at = search + rel + needle.len();
        let boundary = lower.as_bytes().get(at).map_or(true, |b| !b.is_ascii_alphanumeric());
        if boundary {
            return match lower[at..].find('>') {
                Some(gt) => from + at + gt + 1,
                None => s.len(),
            };
        }
        search = at;
    }
    s.len()
}

/// Comments, doctypes and processing instructions are dropped outright.
fn skip_declaration(s: &str, start: usize) -> Option<usize> {
    let rest = &s[start..];
    if let Some(body) = rest.strip_prefix("<!--") {
        return Some(body.find("-->").map_or(s.len(), |n| start + 4 + n + 3));
    }
    if rest.starts_with("<!") || rest.starts_with("<?") {
        return Some(rest.find('>').map_or(s.len(), |n| start + n + 1));
    }
    None
}

// ---------------------------------------------------------------------------
// Stage 2: tree parse and allow-list re-filter
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum RawNode {
    Text(String),
    Element { name: String, children: Vec<RawNode> },
}

fn parse(markup: &str) -> Vec<RawNode> {
    let mut root: Vec<RawNode> = Vec::new();
    let mut stack: Vec<(String, Vec<RawNode>)> = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < markup.len() {
        if markup.as_bytes()[i] == b'<' {
            if let Some(tag) = scan_tag(markup, i) {
                flush_text(&mut text, &mut stack, &mut root);
                if tag.closing {
                    if let Some(pos) = stack.iter().rposition(|(n, _)| *n == tag.name) {
                        while stack.len() > pos {
                            close_top(&mut stack, &mut root);
                        }
                    }
                } else if tag.name == "br" {
                    push_child(
                        &mut stack,
                        &mut root,
                        RawNode::Element {
                            name: tag.name,
                            children: Vec::new(),
                        },
                    );
                } else {
                    // A new <p> or <li> implicitly closes an open sibling.
                    let implicit = matches!(tag.name.as_str(), "p" | "li");
                    if implicit && stack.last().is_some_and(|(n, _)| *n == tag.name) {
                        close_top(&mut stack, &mut root);
                    }
                    stack.push((tag.name, Vec::new()));
                }
                i = tag.end;
                continue;
            }
        }

        let ch_len = markup[i..].chars().next().map_or(1, char::len_utf8);
        let next = markup[i + ch_len..]
            .find('<')
            .map_or(markup.len(), |n| i + ch_len + n);
        text.push_str(&markup[i..next]);
        i = next;
    }

    flush_text(&mut text, &mut stack, &mut root);
    while !stack.is_empty() {
        close_top(&mut stack, &mut root);
    }
    root
}

fn push_child(stack: &mut [(String, Vec<RawNode>)], root: &mut Vec<RawNode>, node: RawNode) {
    match stack.last_mut() {
        Some((_, children)) => children.push(node),
        None => root.push(node),
    }
}

fn close_top(stack: &mut Vec<(String, Vec<RawNode>)>, root: &mut Vec<RawNode>) {
    if let Some((name, children)) = stack.pop() {
        push_child(stack, root, RawNode::Element { name, children });
    }
}

fn flush_text(text: &mut String, stack: &mut [(String, Vec<RawNode>)], root: &mut Vec<RawNode>) {
    if text.is_empty() {
        return;
    }
    let decoded = decode_entities(text);
    text.clear();
    if !decoded.is_empty() {
        push_child(stack, root, RawNode::Text(decoded));
    }
}

fn filter(nodes: Vec<RawNode>) -> Vec<Node> {
    nodes.into_iter().filter_map(to_node).collect()
}

fn to_node(node: RawNode) -> Option<Node> {
    match node {
        RawNode::Text(text) => Some(Node::Text { text }),
        RawNode::Element { name, children } => {
            if !ALLOWED_TAGS.contains(&name.as_str()) {
                return None;
            }
            let tag = Tag::from_name(&name)?;
            let children = if tag == Tag::Br {
                Vec::new()
            } else {
                filter(children)
            };
            Some(Node::element(tag, children))
        }
    }
}

/// Decode the named entities the advisory service realistically emits plus
/// numeric references.  Unknown entities are kept literally.
fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&semi| semi <= 10)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(|c: char| c == 'x' || c == 'X') {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            match char::from_u32(code) {
                Some('\0') | None => Some('\u{fffd}'),
                Some(c) => Some(c),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
