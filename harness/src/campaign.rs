//! Multi-run driver for `model-harness run`.

use tracing::{info, warn};

use crate::engine::{Engine, RunFailure, RunOptions, RunReport};
use crate::io::coordinator::Coordinator;
use crate::io::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignOptions {
    pub runs: u32,
    pub steps: u32,
    pub seed: u64,
}

/// Reason why `run_campaign` stopped.
#[derive(Debug)]
pub enum CampaignStop {
    /// Every run finished without a failure.
    AllPassed,
    /// The first failing run. Later runs were not attempted.
    Failed {
        run_index: u64,
        failure: Box<RunFailure>,
    },
}

/// Summary of a campaign.
#[derive(Debug)]
pub struct CampaignOutcome {
    pub runs_passed: u32,
    pub stop: CampaignStop,
}

/// Run the engine `options.runs` times, stopping at the first failure.
/// `on_run` sees every passing run.
pub fn run_campaign<M, T, F>(
    engine: &mut Engine<M, T>,
    coord: &mut Coordinator<T>,
    options: &CampaignOptions,
    mut on_run: F,
) -> CampaignOutcome
where
    M: Clone + serde::Serialize,
    T: Transport,
    F: FnMut(u64, &RunReport<M>),
{
    info!(seed = options.seed, runs = options.runs, steps = options.steps, "starting campaign");
    let mut runs_passed = 0u32;
    for run_index in 0..u64::from(options.runs) {
        let run = RunOptions {
            steps: options.steps,
            seed: options.seed,
            run_index,
        };
        match engine.run(coord, &run) {
            Ok(report) => {
                runs_passed += 1;
                on_run(run_index, &report);
            }
            Err(failure) => {
                warn!(run_index, failure = %failure, "run failed, stopping campaign");
                return CampaignOutcome {
                    runs_passed,
                    stop: CampaignStop::Failed {
                        run_index,
                        failure: Box::new(failure),
                    },
                };
            }
        }
    }
    CampaignOutcome {
        runs_passed,
        stop: CampaignStop::AllPassed,
    }
}
