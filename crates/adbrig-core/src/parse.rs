//! Scans over accumulated adb output. Plain text extraction, no state.

use std::sync::OnceLock;

use regex::Regex;

static IFCONFIG_IP_REGEX: OnceLock<Regex> = OnceLock::new();
static IP_CMD_IP_REGEX: OnceLock<Regex> = OnceLock::new();

fn ifconfig_ip_regex() -> &'static Regex {
    IFCONFIG_IP_REGEX
        .get_or_init(|| Regex::new(r"(?i)inet addr:([\d.]+)").expect("invalid ifconfig regex"))
}

fn ip_cmd_ip_regex() -> &'static Regex {
    IP_CMD_IP_REGEX
        .get_or_init(|| Regex::new(r"wlan0\s+inet\s+([\d.]+)").expect("invalid ip cmd regex"))
}

/// Serials from `adb devices` output: lines with exactly two tab-separated
/// fields whose second field is literally "device".
pub fn device_serials(stdout: &str) -> Vec<String> {
    let mut serials = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split('\t');
        let (Some(serial), Some(state), None) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if state == "device" && !serial.is_empty() {
            serials.push(serial.to_string());
        }
    }
    serials
}

/// Device address from `ifconfig` style output ("inet addr:192.168.1.2").
pub fn ifconfig_ip(stdout: &str) -> Option<String> {
    ifconfig_ip_regex()
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// Device address from `ip addr` style output ("wlan0    inet 192.168.1.2").
pub fn ip_cmd_ip(stdout: &str) -> Option<String> {
    ip_cmd_ip_regex()
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// Entries from `ls -1` output, minus the synthetic "total" header and the
/// "." / ".." entries.
pub fn ls_entries(output: &str) -> Vec<String> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("total") || trimmed == "." || trimmed == ".."
        {
            continue;
        }
        entries.push(trimmed.to_string());
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_serials_requires_exact_shape() {
        let out = "List of devices attached\n\
                   P7C0218510000537\tdevice\n\
                   emulator-5554\toffline\n\
                   192.168.1.7:5555\tdevice\n\
                   garbage line without tab\n\
                   a\tb\tc\n";
        assert_eq!(
            device_serials(out),
            vec!["P7C0218510000537".to_string(), "192.168.1.7:5555".to_string()]
        );
    }

    #[test]
    fn device_serials_handles_crlf() {
        let out = "List of devices attached\r\nabc123\tdevice\r\n";
        assert_eq!(device_serials(out), vec!["abc123".to_string()]);
    }

    #[test]
    fn ifconfig_ip_extracts_dotted_quad() {
        let out = "wlan0     Link encap:Ethernet\n          inet addr:192.168.1.42  Bcast:192.168.1.255\n";
        assert_eq!(ifconfig_ip(out), Some("192.168.1.42".to_string()));
        assert_eq!(ifconfig_ip("no interfaces here"), None);
    }

    #[test]
    fn ip_cmd_ip_extracts_dotted_quad() {
        let out = "24: wlan0    inet 10.0.0.7/24 brd 10.0.0.255 scope global wlan0\n";
        assert_eq!(ip_cmd_ip(out), Some("10.0.0.7".to_string()));
        assert_eq!(ip_cmd_ip("eth0    inet 10.0.0.8/24"), None);
    }

    #[test]
    fn ls_entries_filters_header_and_dot_dirs() {
        let out = "total 16\n.\n..\nDCIM\nDownload\n\nAndroid\n";
        assert_eq!(
            ls_entries(out),
            vec!["DCIM".to_string(), "Download".to_string(), "Android".to_string()]
        );
    }
}
