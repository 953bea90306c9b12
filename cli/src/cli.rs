use crate::config::{expand_home, Conf, DEFAULT_CONFIG_PATH};
use anyhow::Context;
use clap::Parser;
use libfrifetch::{crawl_courses, CrawlReport, CrawlRule, Session, DEFAULT_MAX_FOLDER_DEPTH};
use owo_colors::{OwoColorize, Stream};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Course material fetcher",
    long_about = "Logs into a Moodle portal and downloads the resources of the configured courses."
)]
pub struct Cli {
    #[arg(short, long, help = "Update all resources, even the ones already downloaded.")]
    update: bool,
    #[arg(short, long, help = "List configured courses.")]
    list: bool,
    #[arg(
        short,
        long,
        default_value = DEFAULT_CONFIG_PATH,
        help = "Configuration file location."
    )]
    config: String,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_FOLDER_DEPTH,
        help = "How many levels of folders to enter from a course page."
    )]
    max_folder_depth: u8,
    #[arg(short, long, help = "Log debug information.")]
    pub verbose: bool,
    #[arg(long, help = "Write logs to hourly rotated files in this directory.")]
    pub log_dir: Option<PathBuf>,
    #[arg(help = "Only fetch these courses. Defaults to all configured courses.")]
    courses: Vec<String>,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let conf = Conf::load(&expand_home(&self.config)?)?;
        let courses = conf.select_courses(&self.courses);

        if self.list {
            for (name, id) in courses.iter() {
                println!("{:>4} {}", name, id);
            }
            return Ok(());
        }

        let targets = conf.course_targets(&courses);
        for target in targets.iter() {
            tokio::fs::create_dir_all(&target.local_path)
                .await
                .with_context(|| {
                    format!("failed to create directory {}", target.local_path.display())
                })?;
        }

        let session = Session::login(&conf.root_url, &conf.username, &conf.password)
            .await
            .context("login failed")?;
        let rule = CrawlRule {
            force_update: self.update,
            max_folder_depth: self.max_folder_depth,
        };
        let report = crawl_courses(&session, &rule, &targets).await;
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &CrawlReport) {
    println!(
        "{} downloaded, {} up to date, {} failed, {} pages unreachable",
        report
            .downloaded
            .if_supports_color(Stream::Stdout, |n| n.green()),
        report.skipped,
        report.failed.if_supports_color(Stream::Stdout, |n| n.red()),
        report
            .pages_failed
            .if_supports_color(Stream::Stdout, |n| n.red()),
    );
}
