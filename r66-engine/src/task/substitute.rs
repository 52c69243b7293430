//! Placeholder substitution for task arguments.
//!
//! Two passes. Named `#PLACEHOLDER#` tokens first, then printf-style
//! positional arguments (`%s`, `%2$s`, `%%`) taken from the words of the
//! transfer's `file_info`.

use chrono::Local;

// ---

use super::TaskEnv;

// ---

/// Substitute every placeholder in `template`.
pub fn substitute(template: &str, env: &TaskEnv) -> String {
    // ---
    let named = substitute_named(template, env);
    let words: Vec<&str> = env.record.file_info.split_whitespace().collect();
    substitute_positional(&named, &words)
}

// ---------------------------------------------------------------------------
// Named
// ---------------------------------------------------------------------------

fn substitute_named(template: &str, env: &TaskEnv) -> String {
    // ---
    if !template.contains('#') {
        return template.to_string();
    }

    let rec = &env.record;
    let now = Local::now();
    let original = std::path::Path::new(&rec.original_filename);
    let original_name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rec.original_filename.clone());
    let true_name = env.file.true_file_name();
    let true_full = env
        .file
        .path()
        .with_file_name(&true_name)
        .display()
        .to_string();

    let values: [(&str, String); 21] = [
        ("#TRUEFULLPATH#", true_full),
        ("#TRUEFILENAME#", true_name),
        ("#ORIGINALFULLPATH#", rec.original_filename.clone()),
        ("#ORIGINALFILENAME#", original_name),
        ("#FILESIZE#", env.file_size.unwrap_or(0).to_string()),
        ("#RULE#", rec.rule_name.clone()),
        ("#DATE#", now.format("%Y%m%d").to_string()),
        ("#HOUR#", now.format("%H%M%S").to_string()),
        ("#REMOTEHOST#", env.remote_host().to_string()),
        ("#LOCALHOST#", env.local_host.clone()),
        ("#TRANSFERID#", rec.transfer_id.to_string()),
        ("#REQUESTERHOST#", rec.requester.clone()),
        ("#REQUESTEDHOST#", rec.requested.clone()),
        (
            "#FULLTRANSFERID#",
            format!("{}_{}_{}", rec.transfer_id, rec.requester, rec.requested),
        ),
        ("#RANKTRANSFER#", rec.rank.to_string()),
        ("#BLOCKSIZE#", rec.block_size.to_string()),
        ("#INPATH#", env.paths.in_path.display().to_string()),
        ("#OUTPATH#", env.paths.out_path.display().to_string()),
        ("#WORKPATH#", env.paths.work_path.display().to_string()),
        ("#ARCHPATH#", env.paths.arch_path.display().to_string()),
        ("#HOMEPATH#", env.paths.home.display().to_string()),
    ];

    let mut out = template.to_string();
    for (token, value) in &values {
        if out.contains(token) {
            out = out.replace(token, value);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Positional
// ---------------------------------------------------------------------------

/// `%s` consumes the next word, `%N$s` picks word `N` (1-based), `%%` is a
/// literal percent. Missing words become empty strings; anything else after
/// a `%` is copied as is.
fn substitute_positional(template: &str, words: &[&str]) -> String {
    // ---
    let mut out = String::with_capacity(template.len());
    let mut next = 0usize;
    let mut rest = template;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('%') {
            out.push('%');
            rest = after;
            continue;
        }
        if let Some(after) = tail.strip_prefix('s') {
            out.push_str(words.get(next).copied().unwrap_or(""));
            next += 1;
            rest = after;
            continue;
        }

        let digits = tail.chars().take_while(char::is_ascii_digit).count();
        if digits > 0 && tail[digits..].starts_with("$s") {
            let index: usize = tail[..digits].parse().unwrap_or(0);
            if index > 0 {
                out.push_str(words.get(index - 1).copied().unwrap_or(""));
            }
            rest = &tail[digits + 2..];
            continue;
        }

        out.push('%');
        rest = tail;
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::task::tests::env_for;
    use std::path::Path;

    #[test]
    fn named_placeholders_resolve_from_record() {
        // ---
        let env = env_for(Path::new("/data/out/report.csv.part"), Path::new("/data"), "");
        let got = substitute(
            "#TRUEFILENAME# #LOCALHOST#->#REMOTEHOST# #FULLTRANSFERID# #RULE#",
            &env,
        );
        assert_eq!(got, "report.csv hosta->hostb 77_hosta_hostb default");
    }

    #[test]
    fn date_and_hour_have_fixed_width() {
        // ---
        let env = env_for(Path::new("/d/f"), Path::new("/d"), "");
        let got = substitute("#DATE#-#HOUR#", &env);
        let (date, hour) = got.split_once('-').unwrap();
        assert_eq!(date.len(), 8, "date is yyyyMMdd, got {date}");
        assert_eq!(hour.len(), 6, "hour is HHmmss, got {hour}");
        assert!(got.chars().filter(|c| *c != '-').all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn positional_arguments_follow_printf_rules() {
        // ---
        let words = ["alpha", "beta", "gamma"];
        assert_eq!(substitute_positional("%s/%s", &words), "alpha/beta");
        assert_eq!(substitute_positional("%3$s-%1$s", &words), "gamma-alpha");
        assert_eq!(substitute_positional("100%% %s", &words), "100% alpha");
        assert_eq!(substitute_positional("%s %s %s %s", &words), "alpha beta gamma ");
        assert_eq!(substitute_positional("50%d", &words), "50%d", "unknown conversions are kept");
    }

    #[test]
    fn positional_uses_file_info_words() {
        let env = env_for(Path::new("/d/f"), Path::new("/d"), "to-archive  2024");
        assert_eq!(substitute("/arch/%2$s/%1$s", &env), "/arch/2024/to-archive");
    }
}
