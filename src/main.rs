mod archive;
mod cancel;
mod config;
mod crawl;
mod download;
mod error;
mod extract;
mod failures;
mod fetch;
mod logging;
mod options;
mod paginate;
mod pipeline;
mod pool;
mod progress;
mod site;
mod stats;
mod storage;
#[cfg(test)]
mod testing;
mod waiter;

use std::{
    fs,
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    process,
    sync::Arc,
};

use tracing::{error, info, warn};
use url::Url;

use crate::{
    cancel::CancelToken,
    config::{Configuration, Key},
    crawl::Crawler,
    failures::FailurePolicy,
    options::Opt,
    site::Site,
    stats::{ProgressLine, RunStats},
    waiter::SystemClock,
};

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

const EXIT_PARTIAL: i32 = 1;
const EXIT_FATAL: i32 = 2;

fn main() {
    let code = match run(&Opt::parse()) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            if e.is_fatal() {
                EXIT_FATAL
            } else {
                EXIT_PARTIAL
            }
        }
    };
    process::exit(code);
}

fn run(opt: &Opt) -> crate::Result<i32> {
    let config = Configuration::init();
    let mut settings = opt.settings(&config)?;

    if opt.output.is_none() && config.get(Key::Output).is_none() {
        if let Some(output) = prompt_output()? {
            settings.output = output;
        }
    }
    fs::create_dir_all(&settings.output)?;
    let _guard = logging::init(&settings.output, opt.verbose)?;

    let start = Url::parse(opt.url())?;
    let site = match opt.site {
        Some(site) => site,
        None => Site::detect(&start)?,
    };

    let cancel = CancelToken::from_interrupt();
    let line = if io::stderr().is_terminal() {
        ProgressLine::stderr()
    } else {
        ProgressLine::hidden()
    };

    let crawler = Crawler::new(
        settings.clone(),
        start,
        site,
        RunStats::new(line),
        Arc::new(SystemClock),
        cancel.clone(),
    )?;

    let mut report = crawler.run();
    info!("{}", report);

    if report.has_failures() && !cancel.is_cancelled() {
        let retry = match opt.on_failure {
            FailurePolicy::Retry => true,
            FailurePolicy::Log => false,
            FailurePolicy::Ask if io::stdin().is_terminal() => crawler.suspend(|| {
                confirm(&format!(
                    "{} albums and {} images failed. Retry them now? [y/N] ",
                    report.failed_albums, report.failed_images
                ))
            })?,
            FailurePolicy::Ask => false,
        };

        if retry {
            report = crawler.retry_failures();
            info!("after retry: {}", report);
        }
    }

    if let Some(path) = crawler.write_failure_log()? {
        warn!("unresolved failures written to {}", path.display());
    }

    if settings.extract_archives && !cancel.is_cancelled() {
        let summary = crawler.extract_archives()?;
        info!(
            "{} archives extracted, {} failed, {} deleted",
            summary.extracted, summary.failed, summary.deleted
        );
    }

    crawler.finish();
    Ok(report.exit_code())
}

/// Asks once for the output root; a blank answer means the current directory.
fn prompt_output() -> crate::Result<Option<PathBuf>> {
    if !io::stdin().is_terminal() {
        return Ok(None);
    }

    let answer = ask("Save albums to (blank for the current directory): ")?;
    Ok((!answer.is_empty()).then(|| PathBuf::from(answer)))
}

fn confirm(question: &str) -> crate::Result<bool> {
    let answer = ask(question)?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn ask(question: &str) -> crate::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", question)?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().to_string())
}
