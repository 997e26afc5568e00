//! MFM (Misskey Flavored Markdown) rendering.
//!
//! The input is converted to a code-point array once and walked by a state
//! machine whose explicit stack models nested scopes. Styles are written
//! into the output as escape sequences on state entry/leave; the printer
//! later handles column measurement and wrapping.

use crate::style::{Style, StyleSheet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RawText,
    /// `<plain>` .. `</plain>`: markup suppressed.
    Plain,
    Backtick1,
    Backtick3,
    Mention,
    Url,
    /// `$[ruby base reading]`: the base part.
    Ruby1,
    /// The reading, emitted in parentheses.
    Ruby2,
    /// Unknown `$[tag ...]`: the tag is dropped, the content kept verbatim.
    UnsuppMfm,
}

// Mention bodies allow "_" + alnum, plus "@.-" past the first character.
// URLs additionally allow the RFC 3986-ish set; '%' is included, parens
// are counted separately.
const URL_EXTRA: &str = "!#$%&'*+,/:;=?[]~";

fn is_ment1(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

fn is_ment2(c: char) -> bool {
    is_ment1(c) || c == '@' || c == '.' || c == '-'
}

fn is_urlchar(c: char) -> bool {
    is_ment2(c) || URL_EXTRA.contains(c)
}

struct Renderer<'a> {
    dst: Vec<char>,
    stack: Vec<State>,
    paren_in_url: i32,
    styles: &'a StyleSheet,
}

impl<'a> Renderer<'a> {
    fn state(&self) -> State {
        *self.stack.last().unwrap_or(&State::RawText)
    }

    fn enter(&mut self, state: State) {
        let style = match state {
            State::Mention => Some(Style::UserId),
            State::Url => {
                self.paren_in_url = 0;
                Some(Style::Url)
            }
            _ => None,
        };
        if let Some(style) = style {
            self.dst.extend(self.styles.begin(style).chars());
        }
    }

    fn leave(&mut self, state: State) {
        let style = match state {
            State::Mention => Some(Style::UserId),
            State::Url => Some(Style::Url),
            _ => None,
        };
        if let Some(style) = style {
            self.dst.extend(self.styles.end(style).chars());
        }
    }

    fn push(&mut self, new_state: State) {
        self.leave(self.state());
        self.enter(new_state);
        self.stack.push(new_state);
    }

    fn pop(&mut self) -> bool {
        self.leave(self.state());
        self.stack.pop();
        match self.stack.last() {
            Some(&st) => {
                self.enter(st);
                true
            }
            None => false,
        }
    }
}

fn at(src: &[char], pos: isize) -> char {
    if pos < 0 {
        return '\0';
    }
    src.get(pos as usize).copied().unwrap_or('\0')
}

fn submatch(src: &[char], pos: usize, key: &str) -> bool {
    for (i, kc) in key.chars().enumerate() {
        if at(src, (pos + i) as isize) != kc {
            return false;
        }
    }
    true
}

/// Case-insensitive (ASCII) prefix match of `tag` at `src[pos..]`.
fn tag_matches(src: &[char], pos: usize, tag: &[char]) -> bool {
    for (i, &tc) in tag.iter().enumerate() {
        let sc = at(src, (pos + i) as isize);
        if sc == '\0' {
            return false;
        }
        if sc.to_ascii_lowercase() != tc.to_ascii_lowercase() {
            return false;
        }
    }
    true
}

/// Render `text` into a styled code-point array. `tags` is the note's
/// `tags[]` list used to validate `#hashtag` runs. In a username context
/// mention/URL/hashtag processing is skipped.
pub fn render(text: &str, tags: &[String], styles: &StyleSheet, is_username: bool) -> Vec<char> {
    let src: Vec<char> = text.chars().collect();
    let tags: Vec<Vec<char>> = tags.iter().map(|t| t.chars().collect()).collect();

    let mut r = Renderer {
        dst: Vec::with_capacity(src.len()),
        stack: vec![State::RawText],
        paren_in_url: 0,
        styles,
    };
    r.enter(State::RawText);

    let posend = src.len();
    let mut pos = 0usize;
    'outer: while pos < posend {
        let c = src[pos];
        let st = r.state();

        // Scope terminators and non-rawtext states first.
        match st {
            State::UnsuppMfm => {
                if c == ']' {
                    pos += 1;
                    r.pop();
                    continue;
                }
                // Otherwise content passes through rawtext handling below.
            }
            State::Ruby1 => {
                if c == ' ' {
                    pos += 1;
                    r.pop();
                    r.push(State::Ruby2);
                    r.dst.push('(');
                    continue;
                }
            }
            State::Ruby2 => {
                if c == ']' {
                    r.dst.push(')');
                    pos += 1;
                    r.pop();
                    continue;
                }
            }
            State::Plain => {
                if c == '<' && submatch(&src, pos + 1, "/plain>") {
                    pos += 8;
                    r.pop();
                    continue;
                }
                r.dst.push(c);
                pos += 1;
                continue;
            }
            State::Backtick1 => {
                if c == '`' {
                    pos += 1;
                    r.pop();
                    continue;
                }
                r.dst.push(c);
                pos += 1;
                continue;
            }
            State::Backtick3 => {
                if c == '`' && submatch(&src, pos + 1, "``") {
                    pos += 3;
                    r.pop();
                    continue;
                }
                r.dst.push(c);
                pos += 1;
                continue;
            }
            State::Mention => {
                if !(c.is_ascii() && is_ment2(c)) {
                    r.pop();
                    continue;
                }
                r.dst.push(c);
                pos += 1;
                continue;
            }
            State::Url => {
                // Parens are legal in URLs, but a paren opened before the
                // URL needs its closing paren back; count and balance.
                if c.is_ascii() && is_urlchar(c) {
                    // stays in the URL
                } else if c == '(' {
                    r.paren_in_url += 1;
                } else if c == ')' && r.paren_in_url > 0 {
                    r.paren_in_url -= 1;
                } else {
                    r.pop();
                    continue;
                }
                r.dst.push(c);
                pos += 1;
                continue;
            }
            State::RawText => {}
        }

        // Rawtext scanning (also reached from inside ruby and unknown-MFM
        // content, which nest like the base text does).
        if c == '<' {
            if submatch(&src, pos + 1, "plain>") {
                pos += 7;
                r.push(State::Plain);
                continue;
            }
        } else if c == '$' && at(&src, pos as isize + 1) == '[' {
            let mut s = pos + 2;
            if submatch(&src, s, "ruby ") {
                s += 5;
                while at(&src, s as isize) == ' ' {
                    s += 1;
                }
                pos = s;
                r.push(State::Ruby1);
                continue;
            }
            // Unknown tag: drop the tag word, keep the content after the
            // first space. No space until EOL means it was not a tag.
            while s < posend {
                if src[s] == ' ' {
                    pos = s + 1;
                    r.push(State::UnsuppMfm);
                    continue 'outer;
                }
                s += 1;
            }
        } else if c == '`' {
            if submatch(&src, pos + 1, "``") {
                pos += 3;
                r.push(State::Backtick3);
            } else {
                pos += 1;
                r.push(State::Backtick1);
            }
            continue;
        } else if is_username {
            // Username fields format nothing beyond the scopes above.
        } else if c == '@' {
            let pc = at(&src, pos as isize - 1);
            let nc = at(&src, pos as isize + 1);
            let prev_is_ment2 = pc != '\0' && pc.is_ascii() && is_ment2(pc);
            let next_is_ment1 = nc != '\0' && nc.is_ascii() && is_ment1(nc);
            if !prev_is_ment2 && next_is_ment1 {
                r.push(State::Mention);
                continue;
            }
        } else if c == '#' {
            // The whole run length is known up front, so no state needed.
            if let Some(tag) = tags.iter().find(|t| tag_matches(&src, pos + 1, t)) {
                r.dst.extend(styles.begin(Style::Tag).chars());
                r.dst.push(c);
                pos += 1;
                let end = (pos + tag.len()).min(posend);
                while pos < end {
                    r.dst.push(src[pos]);
                    pos += 1;
                }
                r.dst.extend(styles.end(Style::Tag).chars());
                continue;
            }
        } else if c == 'h' && (submatch(&src, pos, "https://") || submatch(&src, pos, "http://")) {
            r.push(State::Url);
            continue;
        }

        r.dst.push(c);
        pos += 1;
    }

    // Unwind whatever scopes are still open so no style leaks.
    while r.pop() {}
    r.leave(State::RawText);

    r.dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BgTheme;

    fn render_str(text: &str, tags: &[&str]) -> String {
        let styles = StyleSheet::new(256, BgTheme::Dark);
        let tags: Vec<String> = tags.iter().map(|s| s.to_string()).collect();
        render(text, &tags, &styles, false).into_iter().collect()
    }

    fn render_plain(text: &str, tags: &[&str], is_username: bool) -> String {
        // Colormode 1 sheet emits no escapes; output is pure text.
        let styles = StyleSheet::new(1, BgTheme::Dark);
        let tags: Vec<String> = tags.iter().map(|s| s.to_string()).collect();
        render(text, &tags, &styles, is_username).into_iter().collect()
    }

    #[test]
    fn plain_scope_suppresses_markup() {
        assert_eq!(render_plain("a<plain>@b `x`</plain>c", &[], false), "a@b `x`c");
    }

    #[test]
    fn backticks_nest_and_close() {
        assert_eq!(render_plain("a`@not_mention`b", &[], false), "a@not_mentionb");
        assert_eq!(render_plain("```@x```", &[], false), "@x");
    }

    #[test]
    fn ruby_reading_is_parenthesized() {
        assert_eq!(
            render_plain("$[ruby \u{6f22} \u{304b}\u{3093}]", &[], false),
            "\u{6f22}(\u{304b}\u{3093})"
        );
        // Extra spaces after the tag word are skipped.
        assert_eq!(render_plain("$[ruby   A B]", &[], false), "A(B)");
    }

    #[test]
    fn unknown_mfm_tag_keeps_content() {
        assert_eq!(render_plain("x$[shake wob]y", &[], false), "xwoby");
        // No space before EOL: not a tag at all.
        assert_eq!(render_plain("x$[shake", &[], false), "x$[shake");
    }

    #[test]
    fn mention_boundaries() {
        let s = render_str("Hello @bob!", &[]);
        assert!(s.contains("\x1b[36m@bob\x1b[0m"));
        // A preceding word character suppresses the mention.
        assert_eq!(render_plain("mail@example.com x", &[], false), "mail@example.com x");
    }

    #[test]
    fn url_with_parens() {
        // Trailing ')' without a matching '(' inside ends the URL.
        let s = render_plain("(http://foo/a)bc", &[], false);
        assert_eq!(s, "(http://foo/a)bc");
        let styled = render_str("(http://foo/a)bc", &[]);
        assert!(styled.contains("http://foo/a\x1b[0m"));
        // Balanced parens stay inside.
        let styled = render_str("http://foo/a(b)c ", &[]);
        assert!(styled.contains("http://foo/a(b)c\x1b[0m"));
    }

    #[test]
    fn hashtag_needs_tag_list() {
        let s = render_str("see #tag end", &["tag"]);
        assert!(s.contains("\x1b[36m#tag\x1b[0m"));
        assert_eq!(render_plain("see #tag end", &[], false), "see #tag end");
        // Case-insensitive match, exact length.
        let s = render_str("#TaG!", &["tag"]);
        assert!(s.contains("#TaG"));
    }

    #[test]
    fn username_context_short_circuits() {
        assert_eq!(render_plain("@bob #tag http://x", &["tag"], true), "@bob #tag http://x");
        // But plain/backtick scopes still work.
        assert_eq!(render_plain("<plain>raw</plain>", &[], true), "raw");
    }

    #[test]
    fn mixed_sample() {
        let s = render_plain(
            "Hello @bob $[ruby \u{6f22} \u{304b}\u{3093}] #tag http://a.b/c!",
            &["tag"],
            false,
        );
        assert_eq!(s, "Hello @bob \u{6f22}(\u{304b}\u{3093}) #tag http://a.b/c!");
    }

    #[test]
    fn all_scopes_drain() {
        // Unterminated scopes unwind; styled output has balanced escapes.
        for input in ["`abc", "<plain>x", "$[ruby a", "@bob", "http://x("] {
            let s = render_str(input, &[]);
            let begins = s.matches("\x1b[").count();
            let resets = s.matches("\x1b[0m").count();
            // every begin that is not a reset has a matching reset
            assert_eq!(begins, resets * 2, "input {:?} -> {:?}", input, s);
        }
    }
}
