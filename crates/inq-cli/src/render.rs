//! Terminal rendering for the final report.
//!
//! Walks pulldown-cmark events and emits ANSI-styled text: headings,
//! emphasis, inline and fenced code, lists, and links. When styling is
//! off (not a tty, or --plain) the report passes through untouched.

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const ITALIC: &str = "\x1b[3m";
const UNDERLINE: &str = "\x1b[4m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";

pub fn render_markdown(content: &str, styled: bool) -> String {
    if !styled {
        return content.trim_end().to_string();
    }

    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
    let parser = Parser::new_ext(content, options);

    let mut out = String::new();
    // Active style codes, innermost last; re-applied after every RESET.
    let mut styles: Vec<&'static str> = Vec::new();
    // List nesting: Some(next_number) for ordered lists, None for bullets.
    let mut list_stack: Vec<Option<u64>> = Vec::new();
    let mut link_url: Option<String> = None;

    for event in parser {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                ensure_blank_line(&mut out);
                let color = match level {
                    HeadingLevel::H1 | HeadingLevel::H2 => GREEN,
                    _ => CYAN,
                };
                push_style(&mut out, &mut styles, BOLD);
                push_style(&mut out, &mut styles, color);
            }
            Event::End(TagEnd::Heading(_)) => {
                pop_style(&mut out, &mut styles);
                pop_style(&mut out, &mut styles);
                out.push('\n');
            }
            Event::Start(Tag::Strong) => push_style(&mut out, &mut styles, BOLD),
            Event::End(TagEnd::Strong) => pop_style(&mut out, &mut styles),
            Event::Start(Tag::Emphasis) => push_style(&mut out, &mut styles, ITALIC),
            Event::End(TagEnd::Emphasis) => pop_style(&mut out, &mut styles),
            Event::Start(Tag::CodeBlock(_)) => {
                ensure_blank_line(&mut out);
                push_style(&mut out, &mut styles, YELLOW);
            }
            Event::End(TagEnd::CodeBlock) => {
                pop_style(&mut out, &mut styles);
                out.push('\n');
            }
            Event::Start(Tag::List(start)) => list_stack.push(start),
            Event::End(TagEnd::List(_)) => {
                list_stack.pop();
                if list_stack.is_empty() {
                    out.push('\n');
                }
            }
            Event::Start(Tag::Item) => {
                let indent = "  ".repeat(list_stack.len().saturating_sub(1));
                match list_stack.last_mut() {
                    Some(Some(number)) => {
                        out.push_str(&format!("{}{}. ", indent, number));
                        *number += 1;
                    }
                    _ => out.push_str(&format!("{}• ", indent)),
                }
            }
            Event::End(TagEnd::Item) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Start(Tag::Link { dest_url, .. }) => {
                push_style(&mut out, &mut styles, UNDERLINE);
                link_url = Some(dest_url.to_string());
            }
            Event::End(TagEnd::Link) => {
                pop_style(&mut out, &mut styles);
                if let Some(url) = link_url.take() {
                    out.push_str(&format!(" ({})", url));
                }
            }
            Event::Start(Tag::Paragraph) => {}
            Event::End(TagEnd::Paragraph) => {
                out.push('\n');
                if list_stack.is_empty() {
                    out.push('\n');
                }
            }
            Event::Text(text) => out.push_str(&text),
            Event::Code(code) => {
                out.push_str(YELLOW);
                out.push_str(&code);
                out.push_str(RESET);
                reapply(&mut out, &styles);
            }
            Event::SoftBreak => out.push(' '),
            Event::HardBreak => out.push('\n'),
            Event::Rule => {
                ensure_blank_line(&mut out);
                out.push_str("────────────────────\n");
            }
            _ => {}
        }
    }

    out.trim_end().to_string()
}

fn push_style(out: &mut String, styles: &mut Vec<&'static str>, style: &'static str) {
    styles.push(style);
    out.push_str(style);
}

fn pop_style(out: &mut String, styles: &mut Vec<&'static str>) {
    styles.pop();
    out.push_str(RESET);
    reapply(out, styles);
}

fn reapply(out: &mut String, styles: &[&'static str]) {
    for style in styles {
        out.push_str(style);
    }
}

fn ensure_blank_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with("\n\n") {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
}
