use std::{
    fs::File,
    time::{Duration, Instant},
};

use image::GrayImage;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{AnswerSet, Catalog, Question},
    config::Config,
    content::{self, ContentClient, Profile},
    display::{Matrix, Pattern},
    epc::Epc,
    error::Result,
    figurine,
    pipe::OpCommand,
    printer::{PAGE_DOTS, Printer},
    reader::{InventoryReport, ReaderHandle},
    shapes,
    slip::{self, Page, SlipRecord},
    store::SlipStore,
};

const ERROR_ACK_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_FLASH: Duration = Duration::from_secs(3);
const INVENTORY_COOLDOWN: Duration = Duration::from_secs(2);
const PRESENCE_WINDOW: Duration = Duration::from_millis(400);
const PRESENCE_GAP: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bored,
    Thinking,
    Printing,
    RemoveWait,
    Error,
}

fn pattern_for(phase: Phase) -> Pattern {
    match phase {
        Phase::Bored => Pattern::Bored,
        Phase::Thinking => Pattern::Thinking,
        Phase::Printing => Pattern::Finish,
        Phase::RemoveWait => Pattern::RemoveFigure,
        Phase::Error => Pattern::Error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrintOutcome {
    Printed,
    Skipped,
    Failed,
}

enum WaitOutcome {
    Tags(Vec<Epc>),
    Lost,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
enum OpFlow {
    Continue,
    Quit,
}

struct CycleOutput {
    record: SlipRecord,
    page: Page,
    raster: GrayImage,
    svg: String,
}

/// Counts consecutive empty presence polls; a single missed read must not end
/// the removal wait.
#[derive(Debug, Default)]
struct ClearDebounce {
    zeros: u8,
}

impl ClearDebounce {
    fn observe(&mut self, tag_count: usize) -> bool {
        if tag_count == 0 {
            self.zeros += 1;
        } else {
            self.zeros = 0;
        }
        self.zeros >= 2
    }
}

/// The installation itself: one control task driving the reader, display,
/// printer, content client and slip store through the visitor cycle.
pub struct Figbox {
    config: Config,
    catalog: Catalog,
    reader: ReaderHandle,
    matrix: Option<Matrix>,
    printer: Option<Printer<File>>,
    content: ContentClient,
    store: SlipStore,
    ops: mpsc::Receiver<OpCommand>,
    ops_closed: bool,
    phase: Phase,
}

impl Figbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        catalog: Catalog,
        reader: ReaderHandle,
        matrix: Option<Matrix>,
        printer: Option<Printer<File>>,
        content: ContentClient,
        store: SlipStore,
        ops: mpsc::Receiver<OpCommand>,
    ) -> Self {
        Self {
            config,
            catalog,
            reader,
            matrix,
            printer,
            content,
            store,
            ops,
            ops_closed: false,
            phase: Phase::Bored,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Installation ready: waiting for {} tokens",
            self.config.cycle.target_tags
        );

        loop {
            self.enter(Phase::Bored);
            self.store.flush_pending().await;

            let tags = match self.wait_for_tags().await {
                WaitOutcome::Tags(tags) => tags,
                WaitOutcome::Lost => {
                    self.fail_cycle().await;
                    continue;
                }
                WaitOutcome::Quit => return Ok(()),
            };

            self.enter(Phase::Thinking);
            let set = match self.catalog.answers_from_tags(tags.iter()) {
                Ok(set) => set,
                Err(err) => {
                    warn!("Cycle aborted: {err}");
                    self.fail_cycle().await;
                    continue;
                }
            };
            let cycle = match self.build_slip(&set).await {
                Ok(cycle) => cycle,
                Err(err) => {
                    warn!("Cycle aborted: {err}");
                    self.fail_cycle().await;
                    continue;
                }
            };

            self.enter(Phase::Printing);
            let outcome = self.print_page(&cycle.page);
            let mut record = cycle.record;
            record.printed = outcome == PrintOutcome::Printed;
            if outcome == PrintOutcome::Failed {
                self.set_pattern(Pattern::Error);
                tokio::time::sleep(ERROR_FLASH).await;
            }
            if let Err(err) = self
                .store
                .persist_and_upload(&record, Some(&cycle.raster), Some(&cycle.svg))
                .await
            {
                error!("Slip {} not persisted: {err}", record.slip_uuid);
            }

            self.enter(Phase::RemoveWait);
            self.wait_for_removal().await;
        }
    }

    /// Entry action of every state: show its display pattern. The display is
    /// updated before the work the pattern announces.
    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("{:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
        self.set_pattern(pattern_for(phase));
    }

    fn set_pattern(&mut self, pattern: Pattern) {
        let Some(matrix) = self.matrix.as_mut() else {
            return;
        };
        if let Err(err) = matrix.set_pattern(pattern) {
            warn!("Display unavailable: {err}");
        }
    }

    async fn fail_cycle(&mut self) {
        self.enter(Phase::Error);
        tokio::time::sleep(ERROR_ACK_INTERVAL).await;
    }

    /// BORED body: keep the inventory worker collecting while servicing
    /// operator commands. Commands cancel the running pass; it restarts on
    /// the next loop turn.
    async fn wait_for_tags(&mut self) -> WaitOutcome {
        loop {
            let mut queued: Vec<OpCommand> = Vec::new();
            let outcome = {
                let collect = self.reader.collect(
                    self.config.cycle.target_tags,
                    self.config.inventory_timeout(),
                );
                tokio::pin!(collect);
                loop {
                    tokio::select! {
                        report = &mut collect => break report,
                        cmd = self.ops.recv(), if !self.ops_closed => {
                            match cmd {
                                Some(cmd) => {
                                    queued.push(cmd);
                                    self.reader.cancel();
                                }
                                None => self.ops_closed = true,
                            }
                        }
                    }
                }
            };

            for cmd in queued {
                if self.handle_op(cmd).await == OpFlow::Quit {
                    return WaitOutcome::Quit;
                }
            }

            match outcome {
                InventoryReport::Complete(map) => {
                    info!("Collected {} token(s)", map.len());
                    return WaitOutcome::Tags(map.into_keys().collect());
                }
                InventoryReport::TimedOut => {
                    debug!("No full token set this pass, cooling down");
                    tokio::time::sleep(INVENTORY_COOLDOWN).await;
                }
                InventoryReport::Cancelled => {}
                InventoryReport::Lost(reason) => {
                    error!("RFID reader lost: {reason}");
                    return WaitOutcome::Lost;
                }
            }
        }
    }

    async fn handle_op(&mut self, cmd: OpCommand) -> OpFlow {
        match cmd {
            OpCommand::Status => {
                info!(
                    "Phase {:?}, {} slip(s) pending upload",
                    self.phase,
                    self.store.pending().len()
                );
                OpFlow::Continue
            }
            OpCommand::Flush => {
                self.store.flush_pending().await;
                OpFlow::Continue
            }
            OpCommand::Demo(id) => {
                self.run_demo(id).await;
                OpFlow::Continue
            }
            OpCommand::Quit => {
                info!("Shutting down on operator request");
                if let Some(matrix) = self.matrix.as_mut() {
                    let _ = matrix.stop();
                }
                OpFlow::Quit
            }
        }
    }

    /// Staff paper check: print a slip for a fixed id. Demo slips are never
    /// logged or uploaded.
    async fn run_demo(&mut self, id: u32) {
        info!("Demo slip for figurine {id}");
        let set = AnswerSet::from_indices(figurine::decode(id));
        match self.build_slip(&set).await {
            Ok(cycle) => {
                let outcome = self.print_page(&cycle.page);
                info!("Demo print outcome: {outcome:?}");
            }
            Err(err) => warn!("Demo failed: {err}"),
        }
    }

    async fn build_slip(&self, set: &AnswerSet) -> Result<CycleOutput> {
        let figurine_id = figurine::encode(set.indices());
        let stack = shapes::resolve(figurine::shapes_of(figurine_id))?;
        let figure = shapes::compose(stack, self.config.slip.figure_height);
        let raster = figure.rasterize(PAGE_DOTS);
        let svg = figure.to_svg();

        let profile = Profile::from_answers(&self.catalog, set, figurine_id);
        let paragraphs = self
            .content
            .generate(&profile, content::personality_key(set))
            .await;
        if paragraphs.used_fallback {
            info!("Figurine {figurine_id} uses fallback paragraphs");
        }

        let record = SlipRecord::new(&self.catalog, set, &paragraphs);
        let title = self
            .catalog
            .title(Question::F05, set.index_of(Question::F05))
            .to_string();
        let page = slip::compose_page(
            &record,
            &title,
            &self.config.slip.banner,
            raster.clone(),
            &self.config.gallery_url,
        );
        Ok(CycleOutput {
            record,
            page,
            raster,
            svg,
        })
    }

    fn print_page(&mut self, page: &Page) -> PrintOutcome {
        let Some(printer) = self.printer.as_mut() else {
            info!("Printing disabled, skipping the page");
            return PrintOutcome::Skipped;
        };

        for attempt in 1..=2 {
            match page.print(printer) {
                Ok(()) => return PrintOutcome::Printed,
                Err(err) => {
                    error!("Print attempt {attempt}/2 failed: {err}");
                    printer.abandon_page();
                }
            }
        }
        PrintOutcome::Failed
    }

    /// REMOVE_WAIT body: done when two consecutive polls see an empty tray,
    /// or when the removal window closes.
    async fn wait_for_removal(&mut self) {
        let deadline = Instant::now() + self.config.remove_timeout();
        let mut debounce = ClearDebounce::default();

        while Instant::now() < deadline {
            match self.reader.presence(PRESENCE_WINDOW).await {
                Ok(count) => {
                    if debounce.observe(count) {
                        info!("Tray cleared");
                        return;
                    }
                }
                Err(err) => {
                    warn!("Presence poll failed: {err}");
                    return;
                }
            }
            tokio::time::sleep(PRESENCE_GAP).await;
        }
        debug!("Removal window closed with tokens still on the tray");
    }
}
