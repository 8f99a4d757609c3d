use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::{
    config::{self, normalize_proxy, Configuration, Key, Mode, Settings},
    error::Error,
    failures::FailurePolicy,
    site::Site,
    waiter::Band,
};

/// A program for downloading every album of a paginated gallery site.
///
/// Settings are read from ~/.albumgrab.conf first; flags given here win.
/// Delays are written in seconds, either as MIN..MAX or as a single number.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Opt {
    /// The listing page to start from.
    url: String,

    /// Root directory for albums and progress files.
    ///
    /// Prompted for on a terminal when neither this flag nor the config file
    /// names one.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Force a site adapter (generic, meitu, ku1372) instead of detecting one.
    #[arg(long)]
    pub site: Option<Site>,

    /// Decode existing files before skipping them; damaged ones are fetched again.
    #[arg(long)]
    verify: bool,

    /// Proxy for every request, as host:port or a full url. Implies --use-proxy.
    #[arg(long)]
    proxy: Option<String>,

    /// Use the proxy named in the config file.
    #[arg(long)]
    use_proxy: bool,

    /// Albums processed at once.
    #[arg(short = 'a', long)]
    album_workers: Option<usize>,

    /// Images downloaded at once within an album.
    #[arg(short = 'i', long)]
    image_workers: Option<usize>,

    /// batch: crawl every listing page first; pipelined: download while crawling.
    #[arg(long)]
    mode: Option<Mode>,

    /// Pause before each page request.
    #[arg(long)]
    page_delay: Option<Band>,

    /// Pause between listing pages.
    #[arg(long)]
    listing_delay: Option<Band>,

    /// Pause before each album.
    #[arg(long)]
    album_delay: Option<Band>,

    /// Pause before each image request.
    #[arg(long)]
    image_delay: Option<Band>,

    /// Requests per second per host; 0 turns the limiter off.
    #[arg(long)]
    rate: Option<f64>,

    /// Attempts per request before giving up on it.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Connect timeout in seconds.
    #[arg(long)]
    connect_timeout: Option<f64>,

    /// Whole-request timeout in seconds.
    #[arg(long)]
    read_timeout: Option<f64>,

    /// Unpack downloaded archives at the end of the run.
    #[arg(long)]
    extract_archives: bool,

    /// Remove archives once they are unpacked.
    #[arg(long)]
    delete_archives: bool,

    /// What to do with failures at the end: ask, retry or log.
    #[arg(long, default_value = "ask")]
    pub on_failure: FailurePolicy,

    /// More console output; repeat for trace.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Opt {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Loads the config file and lays these flags over it.
    pub fn settings(&self, config: &Configuration) -> crate::Result<Settings> {
        let mut settings = Settings::from_config(config)?;

        if let Some(output) = &self.output {
            settings.output = output.clone();
        }

        if let Some(proxy) = &self.proxy {
            settings.proxy = Some(normalize_proxy(proxy));
        } else if self.use_proxy && settings.proxy.is_none() {
            let proxy = config.get(Key::Proxy).ok_or_else(|| {
                Error::Configuration(Key::Proxy, "--use-proxy given but no proxy configured".into())
            })?;
            settings.proxy = Some(normalize_proxy(proxy));
        }

        settings.verify |= self.verify;
        settings.extract_archives |= self.extract_archives;
        settings.delete_archives |= self.delete_archives;

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    settings.$field = value;
                })*
            };
        }

        apply!(
            album_workers,
            image_workers,
            mode,
            page_delay,
            listing_delay,
            album_delay,
            image_delay,
            max_attempts
        );

        if let Some(rate) = self.rate {
            settings.rate = (rate > 0.0).then_some(rate);
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout = config::seconds(Key::ConnectTimeout, secs)?;
        }
        if let Some(secs) = self.read_timeout {
            settings.read_timeout = config::seconds(Key::ReadTimeout, secs)?;
        }

        settings.validate()?;
        Ok(settings)
    }
}
