use std::{collections::HashMap, fs, path::PathBuf, str::FromStr, time::Duration};

use directories::UserDirs;

use crate::{error::Error, waiter::Band, Result};

/// Raw values read from `~/.albumgrab.conf`.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    config: HashMap<Key, String>,
}

impl Configuration {
    /// Reads the user's configuration file.
    ///
    /// Should there be no configuration file, a blank configuration is produced.
    pub fn init() -> Self {
        let text = UserDirs::new()
            .map(|dirs| dirs.home_dir().join(".albumgrab.conf"))
            .and_then(|conf| fs::read_to_string(conf).ok());

        text.map(|text| Configuration::from_text(&text))
            .unwrap_or_default()
    }

    pub fn from_text(text: &str) -> Self {
        Configuration {
            config: read_config(text),
        }
    }

    pub fn get(&self, key: Key) -> Option<&str> {
        self.config.get(&key).map(AsRef::as_ref)
    }

    /// Parses the value for `key`, if one was configured.
    pub fn parse<T>(&self, key: Key) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: ToString,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|e: T::Err| Error::Configuration(key, e.to_string()))
            })
            .transpose()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Key {
    Output,
    Proxy,
    UseProxy,
    Verify,
    AlbumWorkers,
    ImageWorkers,
    Mode,
    PageDelay,
    ListingDelay,
    AlbumDelay,
    ImageDelay,
    Rate,
    MaxAttempts,
    ConnectTimeout,
    ReadTimeout,
    ExtractArchives,
    DeleteArchives,
}

impl Key {
    fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "output" => Some(Key::Output),
            "proxy" => Some(Key::Proxy),
            "use_proxy" => Some(Key::UseProxy),
            "verify" => Some(Key::Verify),
            "album_workers" => Some(Key::AlbumWorkers),
            "image_workers" => Some(Key::ImageWorkers),
            "mode" => Some(Key::Mode),
            "page_delay" => Some(Key::PageDelay),
            "listing_delay" => Some(Key::ListingDelay),
            "album_delay" => Some(Key::AlbumDelay),
            "image_delay" => Some(Key::ImageDelay),
            "rate" => Some(Key::Rate),
            "max_attempts" => Some(Key::MaxAttempts),
            "connect_timeout" => Some(Key::ConnectTimeout),
            "read_timeout" => Some(Key::ReadTimeout),
            "extract_archives" => Some(Key::ExtractArchives),
            "delete_archives" => Some(Key::DeleteArchives),
            _ => None,
        }
    }
}

fn read_config(text: &str) -> HashMap<Key, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }

            let (key, value) = line.split_once('=')?;
            Key::from_identifier(key.trim()).map(|key| (key, value.trim().to_string()))
        })
        .collect()
}

/// How discovered albums reach the album pool.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Mode {
    /// Crawl every listing page before downloading anything.
    Batch,
    /// Download albums while the listing crawl is still running.
    #[default]
    Pipelined,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "batch" => Ok(Mode::Batch),
            "pipelined" => Ok(Mode::Pipelined),
            other => Err(format!("unknown mode {:?}", other)),
        }
    }
}

/// Fully resolved run settings: defaults, then the config file, then flags.
#[derive(Clone, Debug)]
pub struct Settings {
    pub output: PathBuf,
    pub proxy: Option<String>,
    pub verify: bool,
    pub album_workers: usize,
    pub image_workers: usize,
    pub mode: Mode,
    /// Pause before each page request.
    pub page_delay: Band,
    /// Pause after each successful page request.
    pub post_delay: Band,
    /// Pause between listing pages.
    pub listing_delay: Band,
    /// Pause before an album's first page.
    pub album_delay: Band,
    /// Pause before each image request.
    pub image_delay: Band,
    /// Requests per second per host; `None` disables the token bucket.
    pub rate: Option<f64>,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub extract_archives: bool,
    pub delete_archives: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: PathBuf::from("."),
            proxy: None,
            verify: false,
            album_workers: 4,
            image_workers: 8,
            mode: Mode::Pipelined,
            page_delay: Band::secs(2.0, 5.0),
            post_delay: Band::secs(1.0, 3.0),
            listing_delay: Band::secs(4.0, 8.0),
            album_delay: Band::secs(3.0, 6.0),
            image_delay: Band::secs(2.0, 6.0),
            rate: Some(2.0),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            extract_archives: false,
            delete_archives: false,
        }
    }
}

impl Settings {
    /// Applies configured values over the defaults.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(output) = config.get(Key::Output) {
            settings.output = PathBuf::from(output);
        }

        // A configured proxy is only used when the toggle is on.
        if config.parse::<bool>(Key::UseProxy)?.unwrap_or_default() {
            let proxy = config
                .get(Key::Proxy)
                .ok_or_else(|| Error::Configuration(Key::Proxy, "use_proxy set without proxy".into()))?;
            settings.proxy = Some(normalize_proxy(proxy));
        }

        macro_rules! apply {
            ($key:expr, $field:ident) => {
                if let Some(value) = config.parse($key)? {
                    settings.$field = value;
                }
            };
        }

        apply!(Key::Verify, verify);
        apply!(Key::AlbumWorkers, album_workers);
        apply!(Key::ImageWorkers, image_workers);
        apply!(Key::Mode, mode);
        apply!(Key::PageDelay, page_delay);
        apply!(Key::ListingDelay, listing_delay);
        apply!(Key::AlbumDelay, album_delay);
        apply!(Key::ImageDelay, image_delay);
        apply!(Key::MaxAttempts, max_attempts);
        apply!(Key::ExtractArchives, extract_archives);
        apply!(Key::DeleteArchives, delete_archives);

        if let Some(rate) = config.parse::<f64>(Key::Rate)? {
            settings.rate = (rate > 0.0).then_some(rate);
        }
        if let Some(secs) = config.parse::<f64>(Key::ConnectTimeout)? {
            settings.connect_timeout = seconds(Key::ConnectTimeout, secs)?;
        }
        if let Some(secs) = config.parse::<f64>(Key::ReadTimeout)? {
            settings.read_timeout = seconds(Key::ReadTimeout, secs)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.album_workers == 0 {
            return Err(Error::Configuration(Key::AlbumWorkers, "must be at least 1".into()));
        }
        if self.image_workers == 0 {
            return Err(Error::Configuration(Key::ImageWorkers, "must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration(Key::MaxAttempts, "must be at least 1".into()));
        }
        Ok(())
    }
}

pub(crate) fn seconds(key: Key, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| Error::Configuration(key, e.to_string()))
}

/// Accepts `host:port` as well as a full proxy url.
pub fn normalize_proxy(proxy: &str) -> String {
    if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{}", proxy)
    }
}
