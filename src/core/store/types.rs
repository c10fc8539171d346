#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Executing,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Planning => "planning",
            RunStatus::Executing => "executing",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(RunStatus::Planning),
            "executing" => Some(RunStatus::Executing),
            "completed" => Some(RunStatus::Completed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Planning | RunStatus::Executing)
    }
}

/// Pipeline phases in strict execution order. The persisted phase index is
/// the position in [`Phase::ALL`]; a completed run stores [`Phase::DONE_INDEX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Build,
    Deploy,
    Initialize,
    Calibrate,
    Preview,
    Announce,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Plan,
        Phase::Build,
        Phase::Deploy,
        Phase::Initialize,
        Phase::Calibrate,
        Phase::Preview,
        Phase::Announce,
        Phase::Complete,
    ];

    /// Phase index stored once every phase has run to completion.
    pub const DONE_INDEX: u8 = Phase::ALL.len() as u8;

    pub fn index(self) -> u8 {
        Phase::ALL.iter().position(|p| *p == self).unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Phase::ALL.get(index as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Deploy => "deploy",
            Phase::Initialize => "initialize",
            Phase::Calibrate => "calibrate",
            Phase::Preview => "preview",
            Phase::Announce => "announce",
            Phase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub phase: u8,
    pub builder_pid: Option<String>,
    pub error: Option<String>,
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub deploy_url: Option<String>,
    pub demo_mode: bool,
    pub created_at: i64,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerChoice {
    Heads,
    Tails,
}

impl WagerChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            WagerChoice::Heads => "heads",
            WagerChoice::Tails => "tails",
        }
    }

    pub fn from_choice(value: &str) -> Option<Self> {
        match value {
            "heads" => Some(WagerChoice::Heads),
            "tails" => Some(WagerChoice::Tails),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Pending,
    Deposited,
    Resolved,
    Expired,
}

impl CommitmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitmentStatus::Pending => "pending",
            CommitmentStatus::Deposited => "deposited",
            CommitmentStatus::Resolved => "resolved",
            CommitmentStatus::Expired => "expired",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommitmentStatus::Pending),
            "deposited" => Some(CommitmentStatus::Deposited),
            "resolved" => Some(CommitmentStatus::Resolved),
            "expired" => Some(CommitmentStatus::Expired),
            _ => None,
        }
    }
}

/// One wagering attempt. `secret` is sampled before any deposit is seen and
/// only revealed through the API once the commitment is resolved.
#[derive(Debug, Clone)]
pub struct OutcomeCommitment {
    pub id: String,
    pub requester: String,
    pub stake: u64,
    pub choice: WagerChoice,
    pub secret: String,
    pub commitment_hash: String,
    pub status: CommitmentStatus,
    pub expires_at: i64,
    pub deposit_ref: Option<String>,
    pub payout_ref: Option<String>,
    pub result_choice: Option<WagerChoice>,
    pub won: Option<bool>,
    pub payout: Option<u64>,
    pub payout_pending: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DailyCounters {
    pub day: String,
    pub runs_shipped: u32,
    pub last_run_end: Option<i64>,
    pub total_wagered: u64,
    pub total_payout: u64,
    pub wins: u32,
    pub losses: u32,
}

impl DailyCounters {
    /// Net amount paid out above what was staked today; zero when the house
    /// is ahead.
    pub fn net_loss(&self) -> u64 {
        self.total_payout.saturating_sub(self.total_wagered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTier {
    Reserve,
    Hot,
    Airlock,
}

impl WalletTier {
    pub fn as_str(self) -> &'static str {
        match self {
            WalletTier::Reserve => "reserve",
            WalletTier::Hot => "hot",
            WalletTier::Airlock => "airlock",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WalletSnapshot {
    pub tier: WalletTier,
    pub address: String,
    pub balance: u64,
    pub synced_at: Option<i64>,
}

/// A payout the circuit breaker refused to execute automatically. The wager
/// outcome is already final; only the fund movement awaits manual release.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingPayout {
    pub id: String,
    pub commitment_id: String,
    pub requester: String,
    pub amount: u64,
    pub reason: String,
    pub created_at: i64,
    pub released_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_indices_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_index(phase.index()), Some(phase));
        }
        assert_eq!(Phase::from_index(Phase::DONE_INDEX), None);
        assert_eq!(Phase::Plan.index(), 0);
        assert_eq!(Phase::Complete.index(), 7);
    }

    #[test]
    fn net_loss_never_underflows() {
        let counters = DailyCounters {
            total_wagered: 100,
            total_payout: 40,
            ..Default::default()
        };
        assert_eq!(counters.net_loss(), 0);
        let counters = DailyCounters {
            total_wagered: 100,
            total_payout: 194,
            ..Default::default()
        };
        assert_eq!(counters.net_loss(), 94);
    }
}
