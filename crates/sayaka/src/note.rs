//! Note, notification and announcement rendering.
//!
//! Messages arrive as dynamic JSON; only a small part of the note shape
//! matters here, so everything is accessed through `serde_json::Value`.

use std::io::Write;

use log::{debug, warn};
use serde_json::Value;

use crate::config::Nsfw;
use crate::printer::{iprint, print_indent, show_image};
use crate::style::{push_styled, Style};
use crate::time::{decode_isotime, format_time};
use crate::{cache, mfm, App};

/// One parsed message from the stream (or the replay file).
pub async fn handle_message(app: &mut App, text: &str) {
    let js: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("json parse failed: {}", e);
            return;
        }
    };

    app.indent_depth = 0;

    let Some(typ) = js["type"].as_str().filter(|t| !t.is_empty()) else {
        println!("No message type?");
        return;
    };

    let crlf;
    if typ == "channel" {
        let body = &js["body"];
        let Some(ityp) = body["type"].as_str() else {
            println!("Unknown message type /channel/?");
            return;
        };
        match ityp {
            "note" => crlf = show_note(app, &body["body"].clone()).await,
            "notification" => crlf = show_notification(app, &body["body"].clone()).await,
            "mention" | "renote" | "reply" | "unfollow" | "follow" | "followed" => {
                debug!("ignore {}", ityp);
                return;
            }
            t if t.starts_with("read")
                || t.starts_with("emoji")
                || t.starts_with("drive")
                || t.starts_with("unread") =>
            {
                debug!("ignore {}", t);
                return;
            }
            other => {
                println!("Unknown message type /channel/{}", other);
                return;
            }
        }
    } else if typ == "announcementCreated" {
        let ann = &js["body"]["announcement"];
        if !ann.is_object() {
            println!("Unknown message type /{}", typ);
            return;
        }
        crlf = show_announcement(app, &ann.clone()).await;
    } else if typ.starts_with("emoji") {
        // Emoji bookkeeping events are noise here.
        return;
    } else {
        println!("Unknown message type /{}", typ);
        return;
    }

    if crlf > 0 {
        println!();
    }
}

struct NoteUser {
    /// Display name, MFM-rendered (username context).
    name: Vec<char>,
    /// `@username[@host]`
    id: String,
    instance: Option<String>,
}

fn get_user(app: &App, note: &Value) -> NoteUser {
    let user = &note["user"];
    let username = user["username"].as_str().unwrap_or("");
    let name_raw = user["name"].as_str().unwrap_or("");
    // An empty display name falls back to the account name.
    let name = if !name_raw.is_empty() {
        mfm::render(name_raw, &[], &app.styles, true)
    } else {
        username.chars().collect()
    };
    let mut id = String::from("@");
    id.push_str(username);
    if let Some(host) = user["host"].as_str() {
        id.push('@');
        id.push_str(host);
    }
    let instance = user["instance"]["name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    NoteUser { name, id, instance }
}

fn collect_tags(note: &Value) -> Vec<String> {
    note["tags"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|t| t.as_str())
                .map(|s| s.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Returns 1 when the caller should add a blank separator line, 0 when
/// not, and -1 when the note was suppressed (NG/NSFW) so neither the
/// renote attribution nor the separator should print.
pub async fn show_note(app: &mut App, note: &Value) -> i32 {
    if !note.is_object() {
        return 0;
    }

    let text = note["text"].as_str().map(str::to_string);
    let cw = note["cw"].as_str().map(str::to_string);
    let files: Vec<Value> = note["files"].as_array().cloned().unwrap_or_default();
    let renote = note
        .get("renote")
        .filter(|r| r.is_object())
        .cloned();

    // A bare renote has no content of its own.
    if text.is_none() && cw.is_none() && files.is_empty() {
        if let Some(inner) = &renote {
            let crlf = Box::pin(show_note(app, inner)).await;
            if crlf >= 0 {
                let owner = format_renote_owner(app, note);
                let mut line: Vec<char> = Vec::new();
                line.extend(app.styles.begin(Style::Renote).chars());
                line.extend(owner.iter());
                line.extend(app.styles.end(Style::Renote).chars());
                iprint(app, &line);
                println!();
            }
            return crlf;
        }
    }

    if app.cfg.nsfw == Nsfw::Hide {
        let sensitive = files
            .iter()
            .any(|f| f["isSensitive"].as_bool().unwrap_or(false));
        if sensitive {
            return -1;
        }
    }

    let user = get_user(app, note);

    let mut headline: Vec<char> = Vec::new();
    headline.extend(app.styles.begin(Style::Username).chars());
    headline.extend(user.name.iter());
    headline.extend(app.styles.end(Style::Username).chars());
    headline.push(' ');
    push_styled(&mut headline, &user.id, Style::UserId, &app.styles);
    if let Some(instance) = &user.instance {
        headline.push(' ');
        push_styled(&mut headline, instance, Style::Username, &app.styles);
    }

    // cw   text  --show-cw  top    bottom  images
    // ---- ----  ---------  -----  ------  ------
    // -    y     *          text   -       y
    // y    *     n          cw     -       n
    // y    *     y          cw     text    y
    let text = text.unwrap_or_default();
    let (top, bottom) = match &cw {
        None => (text.clone(), None),
        Some(cw_text) => (
            cw_text.clone(),
            if app.cfg.show_cw { Some(text.clone()) } else { None },
        ),
    };

    if let Some(rule) = app.ngwords.match_text(&top, &user.id) {
        let ngtext = rule.text.clone();
        return show_ng(app, note, &user, &ngtext);
    }
    if let Some(bottom) = &bottom {
        if let Some(rule) = app.ngwords.match_text(bottom, &user.id) {
            let ngtext = rule.text.clone();
            return show_ng(app, note, &user, &ngtext);
        }
    }

    let tags = collect_tags(note);
    let mut textline = mfm::render(&top, &tags, &app.styles, false);
    if cw.is_some() {
        textline.extend(" [CW]".chars());
        if bottom.is_some() {
            textline.push('\n');
        }
    }
    if let Some(bottom) = &bottom {
        textline.extend(mfm::render(bottom, &tags, &app.styles, false));
    }

    show_icon(app, &note["user"].clone(), &user.id).await;

    iprint(app, &headline);
    println!();
    iprint(app, &textline);
    println!();

    // Attachments and the poll belong to the body; with a closed CW they
    // stay hidden too.
    if cw.is_none() || app.cfg.show_cw {
        app.image_count = 0;
        app.image_next_cols = 0;
        app.image_max_rows = 0;
        for (i, file) in files.iter().enumerate() {
            {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                print_indent(&mut out, app.indent_depth + 1, app.screen.indent_cols);
                let _ = out.flush();
            }
            show_photo(app, file, i as i32).await;
            print!("\r");
        }

        if let Some(poll) = format_poll(&note["poll"]) {
            let line: Vec<char> = poll.chars().collect();
            iprint(app, &line);
            println!();
        }
    }

    // Quoted note; its suppression does not propagate to us.
    if let Some(renote) = &renote {
        app.indent_depth += 1;
        Box::pin(show_note(app, renote)).await;
        app.indent_depth -= 1;
    }

    let time = format_note_time(note);
    let rn = format_renote_count(note);
    let react = format_reaction_count(note);
    let mut foot: Vec<char> = Vec::new();
    push_styled(&mut foot, &time, Style::Time, &app.styles);
    push_styled(&mut foot, &rn, Style::Renote, &app.styles);
    push_styled(&mut foot, &react, Style::Reaction, &app.styles);
    iprint(app, &foot);
    println!();

    1
}

/// Avatar block: reserve three rows, save the cursor, draw, restore.
async fn show_icon(app: &mut App, user: &Value, userid: &str) {
    print!("\n\n\n\x1b[3A\x1b7");
    if app.indent_depth > 0 {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        print_indent(&mut out, app.indent_depth, app.screen.indent_cols);
        let _ = out.flush();
    }

    let mut shown = false;
    if app.cfg.show_image {
        if let Some(url) = user["avatarUrl"].as_str().map(str::to_string) {
            // Misskey image URLs are long and nested; a hash of the whole
            // URL is the only reliable cache key.
            let name =
                cache::icon_cache_name(&app.cfg.colorname, app.screen.font_h, userid, &url);
            let size = app.screen.icon_size;
            shown = show_image(app, &name, &url, size, size, false, -1).await;
        }
        if !shown {
            if let Some(hash) = user["avatarBlurhash"].as_str().map(str::to_string) {
                let name =
                    cache::icon_cache_name(&app.cfg.colorname, app.screen.font_h, userid, &hash);
                let url = format!("blurhash://{}", hash);
                let size = app.screen.icon_size;
                shown = show_image(app, &name, &url, size, size, false, -1).await;
            }
        }
    }

    if shown {
        // Cursor-up before the restore keeps terminals without save/
        // restore support roughly in place.
        print!("\r\x1b[3A\x1b8");
    } else {
        print!(" *\r");
    }
}

/// One attachment. NSFW policy per file:
/// - sensitive + hide was handled a level up,
/// - alt prints only `(mime) [NSFW]`,
/// - blur renders the blurhash (shaded when sensitive),
/// - show renders the thumbnail.
async fn show_photo(app: &mut App, file: &Value, index: i32) -> bool {
    let mut filetype_msg = "";
    let mut shown = false;

    if app.cfg.show_image {
        let sensitive = file["isSensitive"].as_bool().unwrap_or(false);
        let image_size = app.screen.image_size;

        let target = if !sensitive || app.cfg.nsfw == Nsfw::Show {
            file["thumbnailUrl"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|url| (url.to_string(), image_size, image_size, false))
        } else {
            match file["blurhash"].as_str().filter(|s| !s.is_empty()) {
                Some(_) if app.cfg.nsfw == Nsfw::Alt => {
                    filetype_msg = " [NSFW]";
                    None
                }
                None => {
                    filetype_msg = " [NSFW]";
                    None
                }
                Some(hash) => {
                    // Aspect-preserving size from the declared dimensions;
                    // the long axis becomes image_size.
                    let props = &file["properties"];
                    let mut w = props["width"].as_u64().unwrap_or(0) as u32;
                    let mut h = props["height"].as_u64().unwrap_or(0) as u32;
                    if w > 0 && h > 0 {
                        if w > h {
                            h = h * image_size / w;
                            w = image_size;
                        } else {
                            w = w * image_size / h;
                            h = image_size;
                        }
                    }
                    if w < 1 {
                        w = image_size;
                    }
                    if h < 1 {
                        h = image_size;
                    }
                    let shade = sensitive && app.cfg.nsfw != Nsfw::Show;
                    Some((format!("blurhash://{}", hash), w, h, shade))
                }
            }
        };

        if let Some((url, w, h, shade)) = target {
            let name = cache::file_cache_name(&app.cfg.colorname, app.screen.font_h, &url);
            shown = show_image(app, &name, &url, w, h, shade, index).await;
        }
    }

    if !shown {
        print_filetype(app, file, filetype_msg);
    }
    shown
}

fn print_filetype(app: &mut App, file: &Value, msg: &str) {
    app.image_count = 0;
    app.image_max_rows = 0;
    app.image_next_cols = 0;

    let typ = file["type"].as_str().unwrap_or("no filetype?");
    // The server transcodes anyway, so anything image/* is just "image".
    let typ = if typ.len() >= 6 && typ[..6].eq_ignore_ascii_case("image/") {
        "image"
    } else {
        typ
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = out.write_all(b"\r");
    print_indent(&mut out, app.indent_depth + 1, app.screen.indent_cols);
    let _ = writeln!(out, "({}){}", typ, msg);
}

fn format_poll(poll: &Value) -> Option<String> {
    let choices = poll["choices"].as_array()?;
    let mut s = String::new();
    for choice in choices {
        let voted = choice["isVoted"].as_bool().unwrap_or(false);
        let text = choice["text"].as_str().unwrap_or("");
        let votes = choice["votes"].as_u64().unwrap_or(0);
        s.push_str(&format!(
            " [{}] {} : {}\n",
            if voted { '*' } else { ' ' },
            text,
            votes
        ));
    }
    let s = s.trim_end().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn format_note_time(note: &Value) -> String {
    note["createdAt"]
        .as_str()
        .and_then(decode_isotime)
        .map(format_time)
        .unwrap_or_default()
}

fn format_renote_count(note: &Value) -> String {
    let n = note["renoteCount"].as_u64().unwrap_or(0);
    if n > 0 {
        format!(" {}RN", n)
    } else {
        String::new()
    }
}

fn format_reaction_count(note: &Value) -> String {
    let n: u64 = note["reactions"]
        .as_object()
        .map(|m| m.values().filter_map(|v| v.as_u64()).sum())
        .unwrap_or(0);
    if n > 0 {
        format!(" {}React", n)
    } else {
        String::new()
    }
}

fn format_renote_owner(app: &App, note: &Value) -> Vec<char> {
    let user = get_user(app, note);
    let mut u: Vec<char> = Vec::new();
    u.extend(format_note_time(note).chars());
    u.extend(" Renoted by ".chars());
    u.extend(user.name.iter());
    u.push(' ');
    u.extend(user.id.chars());
    if let Some(instance) = &user.instance {
        u.push(' ');
        u.extend(instance.chars());
    }
    u
}

/// NG replacement: name + time + the matched word, nothing else. The -1
/// return also suppresses any surrounding renote line.
fn show_ng(app: &App, note: &Value, user: &NoteUser, ngtext: &str) -> i32 {
    let mut headline: Vec<char> = Vec::new();
    headline.extend(app.styles.begin(Style::Time).chars());
    headline.extend(user.name.iter());
    headline.push(' ');
    headline.extend(user.id.chars());
    if let Some(instance) = &user.instance {
        headline.push(' ');
        headline.extend(instance.chars());
    }
    headline.extend(app.styles.end(Style::Time).chars());

    let time = format_note_time(note);
    let mut footline: Vec<char> = Vec::new();
    push_styled(&mut footline, &time, Style::Time, &app.styles);
    footline.push(' ');
    push_styled(&mut footline, ngtext, Style::Ng, &app.styles);

    iprint(app, &headline);
    println!();
    iprint(app, &footline);
    println!();
    println!();
    -1
}

async fn show_notification(app: &mut App, body: &Value) -> i32 {
    let Some(typ) = body["type"].as_str() else {
        println!("notification but has no type?");
        return 0;
    };

    match typ {
        "reaction" => {
            let note = body["note"].clone();
            if !note.is_object() {
                println!("notification/reaction but has no note?");
                return 0;
            }
            Box::pin(show_note(app, &note)).await;

            let time = format_note_time(body);
            let user = get_user(app, body);
            let reaction = body["reaction"].as_str().unwrap_or("");

            let mut u: Vec<char> = Vec::new();
            u.extend(app.styles.begin(Style::Reaction).chars());
            u.extend(time.chars());
            u.push(' ');
            u.extend(reaction.chars());
            u.extend(" from ".chars());
            u.extend(user.name.iter());
            u.push(' ');
            u.extend(user.id.chars());
            if let Some(instance) = &user.instance {
                u.push(' ');
                u.extend(instance.chars());
            }
            u.extend(app.styles.end(Style::Reaction).chars());
            iprint(app, &u);
            println!();
            1
        }
        "follow" => {
            let time = format_note_time(body);
            let user = get_user(app, body);

            print!(" *\r");
            let mut u: Vec<char> = Vec::new();
            u.extend("Followed by ".chars());
            u.extend(app.styles.begin(Style::Username).chars());
            u.extend(user.name.iter());
            u.extend(app.styles.end(Style::Username).chars());
            u.push(' ');
            push_styled(&mut u, &user.id, Style::UserId, &app.styles);
            if let Some(instance) = &user.instance {
                u.push(' ');
                push_styled(&mut u, instance, Style::Username, &app.styles);
            }
            iprint(app, &u);
            println!();

            let mut t: Vec<char> = Vec::new();
            push_styled(&mut t, &time, Style::Time, &app.styles);
            iprint(app, &t);
            println!();
            1
        }
        "achievementEarned" => {
            let achievement = body["achievement"].as_str().unwrap_or("");
            // No timestamp of its own; the current time stands in.
            let time = format_time(chrono::Local::now());

            print!(" *\r");
            let mut u: Vec<char> = Vec::new();
            u.extend("Achieved \"".chars());
            push_styled(&mut u, achievement, Style::Username, &app.styles);
            u.push('"');
            iprint(app, &u);
            println!();

            let mut t: Vec<char> = Vec::new();
            push_styled(&mut t, &time, Style::Time, &app.styles);
            iprint(app, &t);
            println!();
            1
        }
        "mention" | "renote" | "reply" => {
            debug!("ignore notification/{}", typ);
            0
        }
        "followRequestAccepted" => 0,
        other => {
            println!("Unknown notification type \"{}\"", other);
            0
        }
    }
}

async fn show_announcement(app: &mut App, ann: &Value) -> i32 {
    print!(" *\r");
    let mut line: Vec<char> = Vec::new();
    push_styled(&mut line, "announcement", Style::Username, &app.styles);
    iprint(app, &line);
    println!();

    let title = ann["title"].as_str().unwrap_or("");
    let text = ann["text"].as_str().unwrap_or("");
    let mut body: Vec<char> = Vec::new();
    if !title.is_empty() {
        body.extend(title.chars());
        body.push('\n');
        body.push('\n');
    }
    if !text.is_empty() {
        body.extend(text.chars());
    }
    iprint(app, &body);
    println!();

    if let Some(url) = ann["imageUrl"].as_str().map(str::to_string) {
        let name = cache::file_cache_name(&app.cfg.colorname, app.screen.font_h, &url);
        app.image_count = 0;
        app.image_next_cols = 0;
        app.image_max_rows = 0;
        {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            print_indent(&mut out, 1, app.screen.indent_cols);
            let _ = out.flush();
        }
        let size = app.screen.image_size;
        show_image(app, &name, &url, size, size, false, 0).await;
        print!("\r");
    }

    let at = ann["updatedAt"]
        .as_str()
        .or_else(|| ann["createdAt"].as_str());
    if let Some(at) = at {
        if let Some(t) = decode_isotime(at) {
            let mut line: Vec<char> = Vec::new();
            push_styled(&mut line, &format_time(t), Style::Time, &app.styles);
            iprint(app, &line);
            println!();
        }
    }

    1
}
