use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const COMMON_FILE: &str = "Common.cfg";
pub const PEER_INFO_FILE: &str = "PeerInfo.cfg";

/// Swarm-wide settings shared by every peer, read from `Common.cfg`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommonConfig {
    pub num_preferred_neighbors: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
}

impl CommonConfig {
    pub fn load(config_dir: &Path) -> Result<CommonConfig, ConfigError> {
        CommonConfig::parse(&read_file(config_dir, COMMON_FILE)?)
    }

    /// Parses `Key Value` lines. Blank lines and `#` comments are skipped,
    /// unknown keys only get a warning.
    pub fn parse(contents: &str) -> Result<CommonConfig, ConfigError> {
        let mut values: HashMap<&str, (usize, &str)> = HashMap::new();

        for (line_no, line) in meaningful_lines(contents) {
            let mut tokens = line.split_whitespace();

            let (Some(key), Some(value), None) = (tokens.next(), tokens.next(), tokens.next()) else {
                return Err(parse_error(COMMON_FILE, line_no, format!("expected `Key Value`, got `{line}`")));
            };

            match key {
                "NumberOfPreferredNeighbors" | "UnchokingInterval" | "OptimisticUnchokingInterval"
                | "FileName" | "FileSize" | "PieceSize" => {
                    values.insert(key, (line_no, value));
                }
                _ => tracing::warn!("{COMMON_FILE}:{line_no}: ignoring unknown key {key}"),
            }
        }

        let config = CommonConfig {
            num_preferred_neighbors: number(&values, "NumberOfPreferredNeighbors")?,
            unchoking_interval: Duration::from_secs(number(&values, "UnchokingInterval")?),
            optimistic_unchoking_interval: Duration::from_secs(number(&values, "OptimisticUnchokingInterval")?),
            file_name: required(&values, "FileName")?.1.to_string(),
            file_size: number(&values, "FileSize")?,
            piece_size: number(&values, "PieceSize")?,
        };

        if config.piece_size == 0 {
            return Err(ConfigError::InvalidValue { key: "PieceSize", message: "must be greater than zero".into() });
        }

        // A PIECE frame's length prefix covers the type byte and index too.
        if config.piece_size > u32::MAX as u64 - 5 {
            return Err(ConfigError::InvalidValue { key: "PieceSize", message: format!("must be at most {}", u32::MAX - 5) });
        }

        if config.unchoking_interval.is_zero() || config.optimistic_unchoking_interval.is_zero() {
            return Err(ConfigError::InvalidValue { key: "UnchokingInterval", message: "intervals must be at least one second".into() });
        }

        Ok(config)
    }

    pub fn num_pieces(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }
}

/// One `PeerInfo.cfg` line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// Every peer in the swarm, in file order. The order decides who dials whom.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Roster {
    peers: Vec<PeerInfo>,
}

impl Roster {
    pub fn load(config_dir: &Path) -> Result<Roster, ConfigError> {
        Roster::parse(&read_file(config_dir, PEER_INFO_FILE)?)
    }

    pub fn parse(contents: &str) -> Result<Roster, ConfigError> {
        let mut peers: Vec<PeerInfo> = Vec::new();

        for (line_no, line) in meaningful_lines(contents) {
            let tokens: Vec<&str> = line.split_whitespace().collect();

            let [id, host, port, has_file] = tokens[..] else {
                return Err(parse_error(PEER_INFO_FILE, line_no, format!("expected `id host port hasFile`, got `{line}`")));
            };

            let peer = PeerInfo {
                id: parse_value(PEER_INFO_FILE, line_no, "peer id", id)?,
                host: host.to_string(),
                port: parse_value(PEER_INFO_FILE, line_no, "port", port)?,
                has_file: match has_file {
                    "1" => true,
                    "0" => false,
                    other => return Err(parse_error(PEER_INFO_FILE, line_no, format!("hasFile must be 0 or 1, got `{other}`"))),
                },
            };

            if peers.iter().any(|p| p.id == peer.id) {
                return Err(parse_error(PEER_INFO_FILE, line_no, format!("peer {} is listed twice", peer.id)));
            }

            peers.push(peer);
        }

        Ok(Roster { peers })
    }

    pub fn ids(&self) -> Vec<u32> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn entry(&self, id: u32) -> Result<&PeerInfo, ConfigError> {
        self.peers.iter().find(|p| p.id == id).ok_or(ConfigError::UnknownPeer(id))
    }

    /// Entries listed before `id`. The local peer dials each of these.
    pub fn dial_targets(&self, id: u32) -> &[PeerInfo] {
        match self.peers.iter().position(|p| p.id == id) {
            Some(index) => &self.peers[..index],
            None => &[],
        }
    }

    /// How many entries come after `id`, i.e. how many inbound connections to expect.
    pub fn expected_inbound(&self, id: u32) -> usize {
        match self.peers.iter().position(|p| p.id == id) {
            Some(index) => self.peers.len() - index - 1,
            None => 0,
        }
    }
}

fn read_file(config_dir: &Path, name: &'static str) -> Result<String, ConfigError> {
    let path = config_dir.join(name);

    std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })
}

/// Non-blank, non-comment lines with their 1-based line numbers.
fn meaningful_lines(contents: &str) -> impl Iterator<Item = (usize, &str)> {
    contents
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn parse_error(file: &'static str, line: usize, message: String) -> ConfigError {
    ConfigError::Parse { file, line, message }
}

fn parse_value<T: FromStr>(file: &'static str, line: usize, what: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| parse_error(file, line, format!("invalid {what} `{value}`")))
}

fn required<'a>(values: &HashMap<&str, (usize, &'a str)>, key: &'static str) -> Result<(usize, &'a str), ConfigError> {
    values
        .get(key)
        .copied()
        .ok_or(ConfigError::MissingKey { file: COMMON_FILE, key })
}

fn number<T: FromStr>(values: &HashMap<&str, (usize, &str)>, key: &'static str) -> Result<T, ConfigError> {
    let (line, value) = required(values, key)?;
    parse_value(COMMON_FILE, line, key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON: &str = "\
NumberOfPreferredNeighbors 2
UnchokingInterval 5
OptimisticUnchokingInterval 15
FileName TheFile.dat
FileSize 10000232
PieceSize 32768
";

    const PEER_INFO: &str = "\
1001 lin114-00.cise.ufl.edu 6008 1
1002 lin114-01.cise.ufl.edu 6008 0

# late joiners
1003 lin114-02.cise.ufl.edu 6008 0
";

    #[test]
    fn parses_common_config() {
        let config = CommonConfig::parse(COMMON).unwrap();

        assert_eq!(config.num_preferred_neighbors, 2);
        assert_eq!(config.unchoking_interval, Duration::from_secs(5));
        assert_eq!(config.optimistic_unchoking_interval, Duration::from_secs(15));
        assert_eq!(config.file_name, "TheFile.dat");
        assert_eq!(config.file_size, 10000232);
        assert_eq!(config.piece_size, 32768);
        assert_eq!(config.num_pieces(), 306);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = CommonConfig::parse(&format!("Verbose yes\n{COMMON}")).unwrap();
        assert_eq!(config.num_preferred_neighbors, 2);
    }

    #[test]
    fn missing_and_bad_common_values_are_errors() {
        let missing = COMMON.replace("PieceSize 32768\n", "");
        assert!(matches!(
            CommonConfig::parse(&missing),
            Err(ConfigError::MissingKey { key: "PieceSize", .. })
        ));

        let garbled = COMMON.replace("FileSize 10000232", "FileSize lots");
        assert!(matches!(
            CommonConfig::parse(&garbled),
            Err(ConfigError::Parse { line: 5, .. })
        ));

        let zero = COMMON.replace("PieceSize 32768", "PieceSize 0");
        assert!(matches!(
            CommonConfig::parse(&zero),
            Err(ConfigError::InvalidValue { key: "PieceSize", .. })
        ));

        let huge = COMMON.replace("PieceSize 32768", "PieceSize 4294967295");
        assert!(matches!(
            CommonConfig::parse(&huge),
            Err(ConfigError::InvalidValue { key: "PieceSize", .. })
        ));

        let largest = COMMON.replace("PieceSize 32768", "PieceSize 4294967290");
        assert_eq!(CommonConfig::parse(&largest).unwrap().piece_size, 4294967290);

        assert!(matches!(
            CommonConfig::parse("FileName a b\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn parses_roster_in_file_order() {
        let roster = Roster::parse(PEER_INFO).unwrap();

        assert_eq!(roster.ids(), vec![1001, 1002, 1003]);
        assert!(roster.entry(1001).unwrap().has_file);
        assert_eq!(roster.entry(1003).unwrap().host, "lin114-02.cise.ufl.edu");
        assert!(matches!(roster.entry(1004), Err(ConfigError::UnknownPeer(1004))));
    }

    #[test]
    fn topology_follows_roster_order() {
        let roster = Roster::parse(PEER_INFO).unwrap();

        assert!(roster.dial_targets(1001).is_empty());
        assert_eq!(roster.expected_inbound(1001), 2);

        let targets: Vec<u32> = roster.dial_targets(1003).iter().map(|p| p.id).collect();
        assert_eq!(targets, vec![1001, 1002]);
        assert_eq!(roster.expected_inbound(1003), 0);
    }

    #[test]
    fn bad_roster_lines_are_errors() {
        assert!(matches!(
            Roster::parse("1001 host 6008 yes\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            Roster::parse("1001 host 6008\n"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Roster::parse("1001 host 70000 1\n"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Roster::parse("1001 a 1 1\n1001 b 2 0\n"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn loads_from_the_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(COMMON_FILE), COMMON).unwrap();

        assert_eq!(CommonConfig::load(dir.path()).unwrap().piece_size, 32768);
        assert!(matches!(Roster::load(dir.path()), Err(ConfigError::Read { .. })));
    }
}
