//! Hayes AT command extraction and classification.
//!
//! Vintage drivers are sloppy: commands arrive with line noise, stray
//! control bytes, and mixed case. [`CommandBuffer`] accumulates serial input
//! until a CR, and [`extract_at_command`] pulls the `AT...` text out of each
//! completed segment, tolerating preamble garbage. [`classify`] maps the
//! textual command onto the small set of families the modem state machine
//! acts on; everything unrecognised lands in [`AtCommand::Generic`], which
//! the modem acknowledges with `OK` — that blanket acknowledgement is the
//! compatibility contract with decades of init strings.

/// Accumulates raw serial bytes and yields complete CR-terminated segments.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    buf: Vec<u8>,
}

/// Cap on buffered command bytes; anything beyond this is line noise.
const COMMAND_BUF_CAP: usize = 4096;

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append serial bytes; returns the segments completed by a CR, in order.
    /// The trailing partial segment stays buffered.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut segments = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\r') {
            let mut segment: Vec<u8> = self.buf.drain(..=pos).collect();
            segment.pop(); // the CR itself
            segments.push(segment);
        }

        if self.buf.len() > COMMAND_BUF_CAP {
            let cut = self.buf.len() - COMMAND_BUF_CAP;
            self.buf.drain(..cut);
        }
        segments
    }

    /// Bytes waiting for a CR.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Pull an AT command out of one CR-terminated segment.
///
/// Trims whitespace, uppercases ASCII, and tolerates noise before the `AT`
/// by slicing from the first occurrence. Returns `None` when no command is
/// present (empty line, pure noise).
pub fn extract_at_command(segment: &[u8]) -> Option<String> {
    let text: String = segment
        .iter()
        .map(|&b| (b as char).to_ascii_uppercase())
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let cmd = if trimmed.starts_with("AT") {
        trimmed
    } else if let Some(at_index) = trimmed.find("AT") {
        &trimmed[at_index..]
    } else {
        return None;
    };

    if cmd.starts_with("AT") {
        Some(cmd.to_string())
    } else {
        None
    }
}

/// Heuristic: does this serial chunk look like the start of a PPP frame
/// rather than a command? Only bytes before the first CR are considered.
pub fn looks_like_ppp(data: &[u8]) -> bool {
    let end = data
        .iter()
        .position(|&b| b == b'\r')
        .unwrap_or(data.len());
    let head = &data[..end];
    head.contains(&0x7E)
        || head.windows(2).any(|w| w == b"~}")
        || head.windows(2).any(|w| w == [0xFF, 0x03])
}

/// Command families the modem state machine distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// Bare `AT` probe.
    Attention,
    /// `ATZ`, `ATZ0` — reset to defaults.
    Reset,
    /// `ATI`..`ATI4` — identity and status pages.
    Identify(u8),
    /// `ATE0` / `ATE1`.
    Echo(bool),
    /// `ATV0` / `ATV1`.
    Verbose(bool),
    /// `ATM<n>` / `ATL<n>` — speaker control, no effect here.
    Speaker,
    /// `ATS<n>=<v>` — store `v mod 256`.
    SetRegister(u8, u8),
    /// `ATS<n>?` — print the register.
    QueryRegister(u8),
    /// Bare `ATS<n>` — select only.
    SelectRegister(u8),
    /// `ATA` — answer; there is no inbound ring to answer.
    Answer,
    /// `ATD...` / `ATDT...` — dial; carries the raw dial string.
    Dial(String),
    /// `ATO` — return online.
    Online,
    /// `ATH` / `ATH0` — hang up.
    Hangup,
    /// `AT&F`, `AT&F0` — factory defaults.
    Factory,
    /// `AT%C<n>` — compression request.
    Compression(u8),
    /// `AT+CSQ`.
    SignalQuality,
    /// `AT+CGMI`.
    Manufacturer,
    /// `AT+CGMM`.
    Model,
    /// `AT+CGMR`.
    Revision,
    /// Anything else beginning with `AT` — acknowledged with OK.
    Generic(String),
    /// Malformed where it matters (S-register out of range or garbled).
    Invalid,
}

/// Classify an uppercased `AT...` command string.
pub fn classify(cmd: &str) -> AtCommand {
    debug_assert!(cmd.starts_with("AT"));
    let body = &cmd[2..];

    if body.is_empty() {
        return AtCommand::Attention;
    }

    match body.as_bytes()[0] {
        b'Z' => AtCommand::Reset,
        b'I' => match body[1..].parse::<u8>() {
            Ok(page) if page <= 4 => AtCommand::Identify(page),
            Err(_) if body.len() == 1 => AtCommand::Identify(0),
            _ => AtCommand::Generic(cmd.to_string()),
        },
        b'E' => match &body[1..] {
            "" | "0" => AtCommand::Echo(false),
            "1" => AtCommand::Echo(true),
            _ => AtCommand::Generic(cmd.to_string()),
        },
        b'V' => match &body[1..] {
            "" | "0" => AtCommand::Verbose(false),
            "1" => AtCommand::Verbose(true),
            _ => AtCommand::Generic(cmd.to_string()),
        },
        b'M' | b'L' => AtCommand::Speaker,
        b'S' => classify_register(&body[1..]),
        b'A' if body.len() == 1 => AtCommand::Answer,
        b'D' => AtCommand::Dial(body[1..].to_string()),
        b'O' => AtCommand::Online,
        b'H' => match &body[1..] {
            "" | "0" => AtCommand::Hangup,
            _ => AtCommand::Generic(cmd.to_string()),
        },
        b'&' => {
            if body[1..].starts_with('F') {
                AtCommand::Factory
            } else {
                AtCommand::Generic(cmd.to_string())
            }
        }
        b'%' => {
            if let Some(rest) = body[1..].strip_prefix('C') {
                match rest.parse::<u8>() {
                    Ok(n) => AtCommand::Compression(n),
                    Err(_) if rest.is_empty() => AtCommand::Compression(0),
                    Err(_) => AtCommand::Generic(cmd.to_string()),
                }
            } else {
                AtCommand::Generic(cmd.to_string())
            }
        }
        b'+' => match &body[1..] {
            "CSQ" => AtCommand::SignalQuality,
            "CGMI" => AtCommand::Manufacturer,
            "CGMM" => AtCommand::Model,
            "CGMR" => AtCommand::Revision,
            _ => AtCommand::Generic(cmd.to_string()),
        },
        _ => AtCommand::Generic(cmd.to_string()),
    }
}

/// Parse the tail of `ATS`: `<n>`, `<n>?`, or `<n>=<v>`.
fn classify_register(tail: &str) -> AtCommand {
    let digits_end = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    if digits_end == 0 {
        return AtCommand::Invalid;
    }
    let Ok(index) = tail[..digits_end].parse::<u32>() else {
        return AtCommand::Invalid;
    };
    if index > 255 {
        return AtCommand::Invalid;
    }
    #[allow(clippy::cast_possible_truncation)]
    let index = index as u8;

    let rest = &tail[digits_end..];
    if rest.is_empty() {
        return AtCommand::SelectRegister(index);
    }
    if rest == "?" {
        return AtCommand::QueryRegister(index);
    }
    if let Some(value) = rest.strip_prefix('=') {
        return match value.parse::<u32>() {
            #[allow(clippy::cast_possible_truncation)]
            Ok(v) => AtCommand::SetRegister(index, (v % 256) as u8),
            Err(_) => AtCommand::Invalid,
        };
    }
    AtCommand::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_splits_on_cr_and_keeps_partial() {
        let mut buf = CommandBuffer::new();
        assert!(buf.push(b"AT").is_empty());
        let segments = buf.push(b"Z\rATI4\rATD555");
        assert_eq!(segments, vec![b"ATZ".to_vec(), b"ATI4".to_vec()]);
        assert_eq!(buf.pending(), b"ATD555");
        let segments = buf.push(b"1212\r");
        assert_eq!(segments, vec![b"ATD5551212".to_vec()]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn extraction_tolerates_noise_and_case() {
        assert_eq!(extract_at_command(b"atz").as_deref(), Some("ATZ"));
        assert_eq!(extract_at_command(b"  AtDt5551212  ").as_deref(), Some("ATDT5551212"));
        assert_eq!(
            extract_at_command(b"\x01\x02xxATH0").as_deref(),
            Some("ATH0")
        );
        assert_eq!(extract_at_command(b""), None);
        assert_eq!(extract_at_command(b"   "), None);
        assert_eq!(extract_at_command(b"HELLO"), None);
    }

    #[test]
    fn classifies_core_families() {
        assert_eq!(classify("AT"), AtCommand::Attention);
        assert_eq!(classify("ATZ"), AtCommand::Reset);
        assert_eq!(classify("ATZ0"), AtCommand::Reset);
        assert_eq!(classify("ATI"), AtCommand::Identify(0));
        assert_eq!(classify("ATI4"), AtCommand::Identify(4));
        assert_eq!(classify("ATE0"), AtCommand::Echo(false));
        assert_eq!(classify("ATE1"), AtCommand::Echo(true));
        assert_eq!(classify("ATV1"), AtCommand::Verbose(true));
        assert_eq!(classify("ATM1"), AtCommand::Speaker);
        assert_eq!(classify("ATL2"), AtCommand::Speaker);
        assert_eq!(classify("ATA"), AtCommand::Answer);
        assert_eq!(classify("ATO"), AtCommand::Online);
        assert_eq!(classify("ATH"), AtCommand::Hangup);
        assert_eq!(classify("ATH0"), AtCommand::Hangup);
        assert_eq!(
            classify("ATDT5551212"),
            AtCommand::Dial("T5551212".to_string())
        );
        assert_eq!(classify("ATD"), AtCommand::Dial(String::new()));
        assert_eq!(classify("AT&F"), AtCommand::Factory);
        assert_eq!(classify("AT%C1"), AtCommand::Compression(1));
        assert_eq!(classify("AT+CSQ"), AtCommand::SignalQuality);
        assert_eq!(classify("AT+CGMI"), AtCommand::Manufacturer);
    }

    #[test]
    fn unknown_commands_fall_through_to_generic() {
        for cmd in ["AT&D2", "AT&C1", "AT&K3", "AT&T", "AT*L", "AT&Q5", "ATX3", "AT&R1", "AT&S0"] {
            assert_eq!(classify(cmd), AtCommand::Generic(cmd.to_string()), "{cmd}");
        }
    }

    #[test]
    fn s_register_forms() {
        assert_eq!(classify("ATS7=42"), AtCommand::SetRegister(7, 42));
        assert_eq!(classify("ATS7=300"), AtCommand::SetRegister(7, 44)); // mod 256
        assert_eq!(classify("ATS7?"), AtCommand::QueryRegister(7));
        assert_eq!(classify("ATS7"), AtCommand::SelectRegister(7));
        assert_eq!(classify("ATS0=0"), AtCommand::SetRegister(0, 0));
        assert_eq!(classify("ATS256=1"), AtCommand::Invalid);
        assert_eq!(classify("ATS999999999999=1"), AtCommand::Invalid);
        assert_eq!(classify("ATS7=abc"), AtCommand::Invalid);
        assert_eq!(classify("ATS"), AtCommand::Invalid);
    }

    proptest::proptest! {
        #[test]
        fn classification_is_total(suffix in "[ -~]{0,24}") {
            let cmd = format!("AT{}", suffix.to_ascii_uppercase());
            let _ = classify(&cmd);
        }

        #[test]
        fn extraction_is_total(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            if let Some(cmd) = extract_at_command(&bytes) {
                proptest::prop_assert!(cmd.starts_with("AT"));
            }
        }
    }

    #[test]
    fn ppp_heuristic_checks_before_cr_only() {
        assert!(looks_like_ppp(&[0x7E, 0xFF, 0x03]));
        assert!(looks_like_ppp(b"~}#!}!}!} }4}\"}&} }"));
        assert!(looks_like_ppp(&[0xFF, 0x03, 0xC0, 0x21]));
        assert!(!looks_like_ppp(b"ATDT5551212\r"));
        // Frame marker after the CR belongs to the next chunk of input
        assert!(!looks_like_ppp(&[b'A', b'T', b'\r', 0x7E]));
    }
}
