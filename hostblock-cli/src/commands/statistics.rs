use hostblock::store::IpState;
use hostblock::{Config, util};

/// Row of the top/last tables.
struct StatRow {
    address: String,
    last_activity: u64,
    activity_score: u32,
    activity_count: u32,
    refused_count: u32,
}

impl StatRow {
    fn new(address: &str, state: &IpState) -> Self {
        StatRow {
            address: address.to_string(),
            last_activity: state.last_activity,
            activity_score: state.activity_score,
            activity_count: state.activity_count,
            refused_count: state.refused_count,
        }
    }
}

pub fn execute(config: &Config) -> anyhow::Result<()> {
    let store = hostblock::store::DataStore::new(&config.data_file_path);
    let data = store.load()?;

    println!("Data file: {}", config.data_file_path.display());
    println!("Total suspicious IP address count: {}", data.ips.len());
    println!("Remote blacklist entry count: {}", data.blacklist.len());
    if data.sync.last_sync > 0 {
        println!(
            "Last blacklist sync: {}",
            util::format_datetime(data.sync.last_sync, &config.datetime_format)
        );
    }
    if data.ips.is_empty() {
        return Ok(());
    }

    let mut rows: Vec<StatRow> = data
        .ips
        .iter()
        .map(|(address, state)| StatRow::new(address, state))
        .collect();

    rows.sort_by(|a, b| b.activity_count.cmp(&a.activity_count));
    let top5: Vec<&StatRow> = rows.iter().take(5).collect();
    println!();
    println!("Top 5 most active addresses:");
    print_table(&top5, config);

    let mut recent: Vec<StatRow> = data
        .ips
        .iter()
        .map(|(address, state)| StatRow::new(address, state))
        .collect();
    recent.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    let last5: Vec<&StatRow> = recent.iter().take(5).collect();
    println!();
    println!("Last activity:");
    print_table(&last5, config);

    Ok(())
}

fn print_table(rows: &[&StatRow], config: &Config) {
    let mut count_width = "Count".len();
    let mut score_width = "Score".len();
    let mut refused_width = "Refused".len();
    let mut time_width = "Last activity".len();
    for row in rows {
        count_width = count_width.max(row.activity_count.to_string().len());
        score_width = score_width.max(row.activity_score.to_string().len());
        refused_width = refused_width.max(row.refused_count.to_string().len());
        time_width = time_width
            .max(util::format_datetime(row.last_activity, &config.datetime_format).len());
    }

    let dashes =
        "-".repeat(28 + count_width + score_width + refused_width + time_width + 9);
    println!("{dashes}");
    println!(
        "     Address     | {} | {} | {} | {}",
        center("Count", count_width),
        center("Score", score_width),
        center("Refused", refused_width),
        center("Last activity", time_width),
    );
    println!("{dashes}");
    for row in rows {
        println!(
            " {:<15} | {} | {} | {} | {}",
            row.address,
            center(&row.activity_count.to_string(), count_width),
            center(&row.activity_score.to_string(), score_width),
            center(&row.refused_count.to_string(), refused_width),
            util::format_datetime(row.last_activity, &config.datetime_format),
        );
    }
}

/// Pad a string on both sides to center it in `width` columns.
fn center(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let pad_left = (width - text.len()) / 2;
    let pad_right = width - text.len() - pad_left;
    format!("{}{}{}", " ".repeat(pad_left), text, " ".repeat(pad_right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_pads_both_sides() {
        assert_eq!(center("ab", 6), "  ab  ");
        assert_eq!(center("ab", 5), " ab  ");
        assert_eq!(center("abcdef", 4), "abcdef");
    }
}
