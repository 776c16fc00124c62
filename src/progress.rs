use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub const RENDER_INTERVAL: Duration = Duration::from_millis(200);
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: usize,
    pub bytes_received_delta: u64,
    pub bytes_total: Option<u64>,
    pub segments_done: usize,
    pub segments_total: usize,
    pub timestamp: Instant,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

pub fn channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Running totals for one job.
#[derive(Debug, Default)]
pub struct JobProgress {
    pub received: u64,
    pub total: Option<u64>,
    pub segments_done: usize,
    pub segments_total: usize,
    window_bytes: u64,
    last_sample: Option<Instant>,
    throughput: f64,
}

impl JobProgress {
    pub fn record(&mut self, event: &ProgressEvent) {
        self.received += event.bytes_received_delta;
        self.window_bytes += event.bytes_received_delta;
        self.total = event.bytes_total;
        self.segments_done = self.segments_done.max(event.segments_done);
        self.segments_total = event.segments_total;
        if self.last_sample.is_none() {
            self.last_sample = Some(event.timestamp);
        }
    }

    /// Folds the bytes seen since the previous sample into the smoothed rate.
    pub fn sample(&mut self, now: Instant) {
        let Some(last) = self.last_sample else {
            return;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let instant_rate = self.window_bytes as f64 / elapsed;
        self.throughput = if self.throughput == 0.0 {
            instant_rate
        } else {
            EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * self.throughput
        };
        self.window_bytes = 0;
        self.last_sample = Some(now);
    }

    /// Bytes per second.
    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.received as f64 * 100.0 / total as f64),
            None => None,
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        if self.throughput <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.received);
        Some(Duration::from_secs_f64(remaining as f64 / self.throughput))
    }
}

/// Renders aggregated progress of all jobs at a fixed cadence.
pub struct ProgressReporter {
    multi: MultiProgress,
    labels: BTreeMap<usize, String>,
    bars: BTreeMap<usize, ProgressBar>,
    jobs: BTreeMap<usize, JobProgress>,
}

impl ProgressReporter {
    pub fn new(labels: BTreeMap<usize, String>, target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            labels,
            bars: BTreeMap::new(),
            jobs: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn job(&self, job_id: usize) -> Option<&JobProgress> {
        self.jobs.get(&job_id)
    }

    pub fn record(&mut self, event: ProgressEvent) {
        self.jobs.entry(event.job_id).or_default().record(&event);
    }

    /// Consumes events until every sender is gone.
    pub async fn run(mut self, mut rx: ProgressReceiver) -> Self {
        let mut ticker = tokio::time::interval(RENDER_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.record(event),
                    None => break,
                },
                _ = ticker.tick() => self.render(Instant::now()),
            }
        }
        self.render(Instant::now());
        for bar in self.bars.values() {
            bar.finish();
        }
        self
    }

    fn render(&mut self, now: Instant) {
        for (job_id, progress) in self.jobs.iter_mut() {
            progress.sample(now);
            let label = self
                .labels
                .get(job_id)
                .cloned()
                .unwrap_or_else(|| format!("job {}", job_id));
            let bar = self.bars.entry(*job_id).or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(progress.total.unwrap_or(0)));
                bar.set_style(bar_style(progress.total.is_some()));
                bar
            });
            if let Some(total) = progress.total {
                bar.set_length(total);
            }
            bar.set_position(progress.received);
            bar.set_message(status_line(&label, progress));
        }
    }
}

fn bar_style(known_total: bool) -> ProgressStyle {
    let template = if known_total {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {msg}"
    } else {
        "{spinner:.green} [{elapsed_precise}] {bytes:>12} {msg}"
    };
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn status_line(label: &str, progress: &JobProgress) -> String {
    let mut line = String::new();
    if let Some(percent) = progress.percent() {
        line.push_str(&format!("{:>5.1}% ", percent));
    }
    line.push_str(&format!("{}/s", HumanBytes(progress.throughput() as u64)));
    if let Some(eta) = progress.eta() {
        line.push_str(&format!(" ETA {}", HumanDuration(eta)));
    }
    line.push_str(&format!(
        " [{}/{} segments] {}",
        progress.segments_done, progress.segments_total, label
    ));
    line
}
