//! Terminal probing: background color, SIXEL capability, cell geometry.
//!
//! The queries put the tty into non-canonical no-echo mode, write the
//! escape sequence and wait briefly for the reply; the previous attributes
//! are restored on every path. Probe failures fall back to the documented
//! defaults (light background, no SIXEL, 7x14 cells).

use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::config::BgTheme;

#[cfg(any(target_arch = "m68k", target_arch = "sparc"))]
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(any(target_arch = "m68k", target_arch = "sparc")))]
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

pub fn is_tty() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) != 0 }
}

/// (columns, rows, x pixels, y pixels) from TIOCGWINSZ, or None.
pub fn window_size() -> Option<(u32, u32, u32, u32)> {
    if !is_tty() {
        return None;
    }
    let mut ws = MaybeUninit::<libc::winsize>::uninit();
    let r = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, ws.as_mut_ptr()) };
    if r != 0 {
        warn!("TIOCGWINSZ failed");
        return None;
    }
    let ws = unsafe { ws.assume_init() };
    Some((
        ws.ws_col as u32,
        ws.ws_row as u32,
        ws.ws_xpixel as u32,
        ws.ws_ypixel as u32,
    ))
}

struct TermiosGuard {
    old: libc::termios,
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDOUT_FILENO, libc::TCSANOW, &self.old);
        }
    }
}

/// Write `query` and wait up to the probe timeout for a reply.
/// Ok(None) is a timeout.
fn query_terminal(query: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let fd = libc::STDOUT_FILENO;

    let mut tc = MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, tc.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let old = unsafe { tc.assume_init() };
    let _guard = TermiosGuard { old };

    // Non-canonical so the reply is delivered bytewise, no echo so it does
    // not land on the screen.
    let mut raw = old;
    raw.c_lflag &= !(libc::ECHO | libc::ICANON);
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let n = unsafe { libc::write(fd, query.as_ptr() as *const libc::c_void, query.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut rfds = MaybeUninit::<libc::fd_set>::uninit();
    unsafe {
        libc::FD_ZERO(rfds.as_mut_ptr());
        libc::FD_SET(fd, rfds.as_mut_ptr());
    }
    let mut timeout = libc::timeval {
        tv_sec: QUERY_TIMEOUT.as_secs() as libc::time_t,
        tv_usec: QUERY_TIMEOUT.subsec_micros() as libc::suseconds_t,
    };
    let r = unsafe {
        libc::select(
            fd + 1,
            rfds.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut timeout,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    if r == 0 {
        return Ok(None);
    }

    let mut buf = [0u8; 128];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Some(buf[..n as usize].to_vec()))
}

/// OSC 11 background color query. None when the terminal does not answer.
pub fn bgcolor() -> Option<BgTheme> {
    if !is_tty() {
        return None;
    }
    let reply = match query_terminal(b"\x1b]11;?\x1b\\") {
        Ok(Some(r)) => r,
        Ok(None) => {
            warn!("bgcolor query: timeout");
            return None;
        }
        Err(e) => {
            warn!("bgcolor query: {}", e);
            return None;
        }
    };
    let reply = String::from_utf8_lossy(&reply);
    let (r, g, b) = parse_osc11(&reply)?;
    // 16-bit channels; only the rough brightness matters here.
    let r = r as f32 / 65536.0;
    let g = g as f32 / 65536.0;
    let b = b as f32 / 65536.0;
    let lum = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    debug!("bgcolor luminance {:.3}", lum);
    Some(if lum < 0.5 { BgTheme::Dark } else { BgTheme::Light })
}

fn parse_osc11(reply: &str) -> Option<(u32, u32, u32)> {
    // ... "rgb:RRRR/GGGG/BBBB" ESC ...
    let rest = &reply[reply.find("rgb:")? + 4..];
    let mut it = rest.split(['/', '\x1b', '\x07']);
    let r = u32::from_str_radix(it.next()?, 16).ok()?;
    let g = u32::from_str_radix(it.next()?, 16).ok()?;
    let b = u32::from_str_radix(it.next()?, 16).ok()?;
    Some((r, g, b))
}

/// DA1 probe: SIXEL support is feature "4" in the reply
/// `ESC [ ? 63 ; 1 ; ... ; 4 ; ... c`.
pub fn support_sixel() -> bool {
    if !is_tty() {
        return false;
    }
    let reply = match query_terminal(b"\x1b[c") {
        Ok(Some(r)) => r,
        Ok(None) => {
            warn!("DA1 query: timeout");
            return false;
        }
        Err(e) => {
            warn!("DA1 query: {}", e);
            return false;
        }
    };
    let reply = String::from_utf8_lossy(&reply);
    parse_da1(&reply)
}

fn parse_da1(reply: &str) -> bool {
    reply
        .trim_start_matches("\x1b[?")
        .trim_end_matches('c')
        .split(';')
        .any(|tok| tok == "4")
}

/// True while a SIXEL sequence is being written; the SIGINT handler uses
/// it to close the sequence before exiting.
pub static IN_SIXEL: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_: libc::c_int) {
    unsafe {
        if IN_SIXEL.load(Ordering::Relaxed) {
            // CAN ESC \ cleanly aborts the DCS sequence.
            libc::write(
                libc::STDOUT_FILENO,
                b"\x18\x1b\\".as_ptr() as *const libc::c_void,
                3,
            );
        }
        libc::write(libc::STDOUT_FILENO, b"\n".as_ptr() as *const libc::c_void, 1);
        libc::_exit(0);
    }
}

pub fn install_sigint() {
    let handler = sigint_handler as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osc11_reply_parses() {
        let reply = "\x1b]11;rgb:1e1e/2222/2828\x1b\\";
        assert_eq!(parse_osc11(reply), Some((0x1e1e, 0x2222, 0x2828)));
        assert_eq!(parse_osc11("nope"), None);
    }

    #[test]
    fn da1_detects_sixel_feature() {
        assert!(parse_da1("\x1b[?63;1;2;4;7c"));
        assert!(!parse_da1("\x1b[?63;1;2;7c"));
        // "44" is not "4".
        assert!(!parse_da1("\x1b[?63;44c"));
    }
}
