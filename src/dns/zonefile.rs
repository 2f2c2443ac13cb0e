//! Master-file (RFC 1035 §5) rendering and parsing.
//!
//! [`render`] always produces the complete zone from a [`ZoneSnapshot`], records sorted by
//! owner, type and content so the same snapshot always renders byte-identical output.
//! [`parse`] reads that output back, along with the subset of the format other tools commonly
//! produce (omitted owners and TTLs, parenthesized continuation lines, comments).

use crate::error::Error;
use crate::model::{DnsRecord, DnsZone, RecordType, ZoneSnapshot};
use std::fmt::Write;
use std::str::FromStr;

const TXT_CHUNK: usize = 255;

/// A name-valued field as it appears in a zone file: names containing a dot are treated as
/// fully qualified and get a trailing dot; bare labels stay relative to `$ORIGIN`.
pub fn render_target(target: &str) -> String {
    if target.ends_with('.') || !target.contains('.') {
        target.to_string()
    } else {
        format!("{target}.")
    }
}

fn quote_txt(content: &str) -> String {
    let mut chunks = Vec::new();
    let mut chunk = String::new();
    for c in content.chars() {
        if chunk.len() + c.len_utf8() > TXT_CHUNK {
            chunks.push(std::mem::take(&mut chunk));
        }
        chunk.push(c);
    }
    chunks.push(chunk);
    chunks
        .iter()
        .map(|chunk| format!("\"{}\"", chunk.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn rdata(record: &DnsRecord) -> String {
    let priority = record.priority.unwrap_or_default();
    match record.record_type {
        RecordType::CNAME | RecordType::NS | RecordType::PTR => render_target(&record.content),
        RecordType::MX => format!("{priority} {}", render_target(&record.content)),
        RecordType::SRV => {
            let mut parts = record.content.rsplitn(2, ' ');
            let target = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            format!("{priority} {rest} {}", render_target(target))
        }
        RecordType::TXT => quote_txt(&record.content),
        RecordType::A | RecordType::AAAA | RecordType::CAA | RecordType::SOA => {
            record.content.clone()
        }
    }
}

fn soa_block(zone: &DnsZone) -> String {
    format!(
        "@\t{ttl}\tIN\tSOA\t{mname}. {rname}. (\n\
         \t\t\t\t{serial}\t; serial\n\
         \t\t\t\t{refresh}\t; refresh\n\
         \t\t\t\t{retry}\t; retry\n\
         \t\t\t\t{expire}\t; expire\n\
         \t\t\t\t{minimum} )\t; minimum\n",
        ttl = zone.ttl,
        mname = zone.primary_ns.trim_end_matches('.'),
        rname = zone.hostmaster.trim_end_matches('.'),
        serial = zone.serial,
        refresh = zone.refresh,
        retry = zone.retry,
        expire = zone.expire,
        minimum = zone.minimum,
    )
}

/// Render the full master file for a zone.
pub fn render(snapshot: &ZoneSnapshot) -> String {
    let zone = &snapshot.zone;
    let mut out = String::new();
    let _ = writeln!(out, "; {} serial {}", zone.name, zone.serial);
    let _ = writeln!(out, "$ORIGIN {}.", zone.name);
    let _ = writeln!(out, "$TTL {}", zone.ttl);
    out.push_str(&soa_block(zone));

    let mut records: Vec<&DnsRecord> = snapshot
        .records
        .iter()
        .filter(|r| r.record_type != RecordType::SOA)
        .collect();
    records.sort_by(|a, b| {
        (&a.name, a.record_type, &a.content, a.priority)
            .cmp(&(&b.name, b.record_type, &b.content, b.priority))
    });
    for record in records {
        let _ = writeln!(
            out,
            "{}\t{}\tIN\t{}\t{}",
            record.name,
            record.ttl,
            record.record_type,
            rdata(record)
        );
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Bare(String),
    Quoted(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Bare(s) | Token::Quoted(s) => s,
        }
    }
}

struct Line {
    /// The line started with whitespace, so its owner is the previous line's.
    continued_owner: bool,
    tokens: Vec<Token>,
}

fn syntax(line: usize, reason: impl Into<String>) -> Error {
    Error::InvalidRecord {
        name: format!("line {line}"),
        record_type: "zone file".into(),
        reason: reason.into(),
    }
}

/// Split a master file into logical lines of tokens, folding parenthesized groups and dropping
/// comments.
fn tokenize(text: &str) -> Result<Vec<Line>, Error> {
    let mut lines = Vec::new();
    let mut current = Line {
        continued_owner: false,
        tokens: Vec::new(),
    };
    let mut chars = text.chars().peekable();
    let mut depth = 0usize;
    let mut line_no = 1;
    let mut at_line_start = true;

    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                line_no += 1;
                if depth == 0 {
                    if !current.tokens.is_empty() {
                        lines.push(current);
                    }
                    current = Line {
                        continued_owner: false,
                        tokens: Vec::new(),
                    };
                    at_line_start = true;
                }
                continue;
            }
            ' ' | '\t' | '\r' => {
                if at_line_start && depth == 0 && current.tokens.is_empty() {
                    current.continued_owner = true;
                }
            }
            ';' => {
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| syntax(line_no, "unbalanced \")\""))?;
            }
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some('\n') | None => return Err(syntax(line_no, "unterminated string")),
                        Some(c) => s.push(c),
                    }
                }
                current.tokens.push(Token::Quoted(s));
            }
            c => {
                let mut s = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, ';' | '(' | ')' | '"') {
                        break;
                    }
                    s.push(next);
                    chars.next();
                }
                current.tokens.push(Token::Bare(s));
            }
        }
        at_line_start = false;
    }
    if depth != 0 {
        return Err(syntax(line_no, "unbalanced \"(\""));
    }
    if !current.tokens.is_empty() {
        lines.push(current);
    }
    Ok(lines)
}

fn parse_target(target: &str) -> String {
    target.trim_end_matches('.').to_ascii_lowercase()
}

/// Parse a master file for `zone` into its record set. The SOA is returned as a record like
/// [`DnsZone::soa_record`] produces; other owners are returned relative to the zone.
pub fn parse(zone: &str, text: &str) -> Result<Vec<DnsRecord>, Error> {
    let mut records = Vec::new();
    let mut origin = zone.to_ascii_lowercase();
    let mut default_ttl = None;
    let mut owner: Option<String> = None;

    for (n, line) in tokenize(text)?.into_iter().enumerate() {
        let n = n + 1;
        let mut tokens = line.tokens.iter();
        match line.tokens.first().map(Token::text) {
            Some("$ORIGIN") => {
                tokens.next();
                let value = tokens.next().ok_or_else(|| syntax(n, "$ORIGIN needs a name"))?;
                origin = parse_target(value.text());
                continue;
            }
            Some("$TTL") => {
                tokens.next();
                let value = tokens.next().ok_or_else(|| syntax(n, "$TTL needs a value"))?;
                default_ttl = Some(
                    value
                        .text()
                        .parse::<u32>()
                        .map_err(|_| syntax(n, "invalid $TTL"))?,
                );
                continue;
            }
            _ => {}
        }

        if !line.continued_owner {
            let name = tokens.next().ok_or_else(|| syntax(n, "missing owner"))?;
            owner = Some(super::records::relative_owner(
                &absolute_owner(name.text(), &origin),
                zone,
            ));
        }
        let name = owner.clone().ok_or_else(|| syntax(n, "missing owner"))?;

        let mut ttl = None;
        let mut record_type = None;
        for token in tokens.by_ref() {
            let text = token.text();
            if text.eq_ignore_ascii_case("IN") {
                continue;
            }
            if ttl.is_none() && text.bytes().all(|b| b.is_ascii_digit()) {
                ttl = Some(text.parse::<u32>().map_err(|_| syntax(n, "invalid TTL"))?);
                continue;
            }
            record_type = Some(RecordType::from_str(text).map_err(|_| {
                syntax(n, format!("unsupported record type \"{text}\""))
            })?);
            break;
        }
        let record_type = record_type.ok_or_else(|| syntax(n, "missing record type"))?;
        let ttl = ttl
            .or(default_ttl)
            .ok_or_else(|| syntax(n, "no TTL and no $TTL"))?;
        let rdata: Vec<&Token> = tokens.collect();
        let field = |i: usize| {
            rdata
                .get(i)
                .map(|t| t.text())
                .ok_or_else(|| syntax(n, format!("incomplete {record_type} record")))
        };
        let priority = |i: usize| {
            field(i)?
                .parse::<u16>()
                .map_err(|_| syntax(n, "invalid priority"))
        };

        let mut record = DnsRecord::new(name, record_type, String::new(), ttl);
        match record_type {
            RecordType::A | RecordType::AAAA => record.content = field(0)?.to_string(),
            RecordType::CNAME | RecordType::NS | RecordType::PTR => {
                record.content = parse_target(field(0)?);
            }
            RecordType::MX => {
                record.priority = Some(priority(0)?);
                record.content = parse_target(field(1)?);
            }
            RecordType::SRV => {
                record.priority = Some(priority(0)?);
                record.content = format!("{} {} {}", field(1)?, field(2)?, parse_target(field(3)?));
            }
            RecordType::TXT => {
                record.content = rdata.iter().map(|t| t.text()).collect();
            }
            RecordType::CAA => {
                record.content = format!("{} {} \"{}\"", field(0)?, field(1)?, field(2)?);
            }
            RecordType::SOA => {
                if rdata.len() != 7 {
                    return Err(syntax(n, "SOA needs 7 fields"));
                }
                record.content = rdata.iter().map(|t| t.text()).collect::<Vec<_>>().join(" ");
            }
        }
        records.push(record);
    }
    Ok(records)
}

fn absolute_owner(name: &str, origin: &str) -> String {
    if name == "@" {
        format!("{origin}.")
    } else if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.{origin}.")
    }
}
