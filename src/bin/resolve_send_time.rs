use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;

use newsletter_dispatch::config;
use newsletter_dispatch::model::{DayOfWeekIndex, HourIndex, IndexedTime, QuarterHourIndex};
use newsletter_dispatch::timezone::{
    closest_utc_send_time, convert_indexed_utc_to_user_timezone, OperationalTarget,
};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the UTC slot for a local weekday, or read a UTC slot back in a timezone"
)]
struct Args {
    /// Day of week, Sunday = 0
    #[arg(long)]
    weekday: i64,

    /// IANA timezone, e.g. America/Los_Angeles
    #[arg(long)]
    timezone: String,

    /// Treat the input as a UTC slot and convert it into `--timezone`
    #[arg(long)]
    inverse: bool,

    /// UTC hour for `--inverse`
    #[arg(long, default_value_t = 0)]
    hour: i64,

    /// UTC quarter hour (0-3) for `--inverse`
    #[arg(long, default_value_t = 0)]
    quarter_hour: i64,

    /// Optional config file supplying the operational timezone and hour
    #[arg(long)]
    config: Option<PathBuf>,
}

fn render(t: &IndexedTime) -> String {
    format!(
        "{} {:02}:{:02} (day={} hour={} quarter={})",
        WEEKDAYS[usize::from(t.day_of_week.value())],
        t.hour.value(),
        t.quarter_hour.minutes(),
        t.day_of_week.value(),
        t.hour.value(),
        t.quarter_hour.value()
    )
}

fn main() -> Result<()> {
    let args = Args::parse();
    let now = Utc::now();
    let weekday = DayOfWeekIndex::new(args.weekday)?;

    if args.inverse {
        let utc = IndexedTime {
            day_of_week: weekday,
            hour: HourIndex::new(args.hour)?,
            quarter_hour: QuarterHourIndex::new(args.quarter_hour)?,
        };
        let local = convert_indexed_utc_to_user_timezone(utc, &args.timezone, now)?;
        println!("UTC   {}", render(&utc));
        println!("local {} in {}", render(&local), args.timezone);
        return Ok(());
    }

    let target = match &args.config {
        Some(path) => config::load(Some(path))
            .with_context(|| format!("loading {}", path.display()))?
            .operational_target(),
        None => OperationalTarget::default(),
    };
    let utc = closest_utc_send_time(weekday, &args.timezone, now, &target)?;
    println!("UTC {}", render(&utc));
    Ok(())
}
