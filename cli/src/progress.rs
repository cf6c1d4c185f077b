use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for a running pipeline, fed from the root task's state.
pub fn start_bar(enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}% {msg}")
            .unwrap()
            .progress_chars("█▓▒░  "),
    );
    bar.set_message("running");
    bar
}

pub fn finish_bar(bar: &ProgressBar, success: bool) {
    if success {
        bar.set_position(100);
        bar.finish_with_message("done");
    } else {
        bar.abandon_with_message("failed");
    }
}
