use soroban_sdk::{contracterror, contracttype, Address, Bytes, BytesN, String};

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Error {
    AlreadyInitialized = 1,
    NotInitialized = 2,
    OrganizationNotFound = 3,
    NotOwnerOrDirector = 4,
    OrganizationNotActive = 5,
    WrongStatus = 6,
    NotChallengeable = 7,
    NotChallenged = 8,
    NoOpenDispute = 9,
    NothingToExecute = 10,
    NeverRequested = 11,
    ChallengeAlreadyResolved = 12,
    ChallengeNotResolved = 13,
    ChallengeNotFound = 14,
    RoundNotFound = 15,
    ExecutionTimeoutNotPassed = 16,
    ResponseTimeoutNotPassed = 17,
    ResponseTimeoutPassed = 18,
    WithdrawTimeoutNotPassed = 19,
    WithdrawTimeoutPassed = 20,
    AppealPeriodOver = 21,
    LoserMustFundFirstHalf = 22,
    InsufficientFunding = 23,
    InvalidParty = 24,
    InvalidRuling = 25,
    DisputeNotFound = 26,
    OnlyArbitrator = 27,
    InvalidAmount = 28,
    Overflow = 29,
}

/// Lifecycle of an organization in the directory. Discriminants are part of
/// the external interface and must not be reordered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[contracttype]
pub enum Status {
    Absent = 0,
    Registering = 1,
    WithdrawalRequested = 2,
    Challenged = 3,
    Disputed = 4,
    Registered = 5,
}

/// A side of a dispute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[contracttype]
pub enum Party {
    None = 0,
    Requester = 1,
    Challenger = 2,
}

/// Amounts keyed by dispute side.
#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct PartyAmounts {
    pub requester: i128,
    pub challenger: i128,
}

impl PartyAmounts {
    pub fn zero() -> PartyAmounts {
        PartyAmounts {
            requester: 0,
            challenger: 0,
        }
    }

    pub fn get(&self, side: Party) -> i128 {
        match side {
            Party::Requester => self.requester,
            Party::Challenger => self.challenger,
            Party::None => 0,
        }
    }

    pub fn set(&mut self, side: Party, amount: i128) {
        match side {
            Party::Requester => self.requester = amount,
            Party::Challenger => self.challenger = amount,
            Party::None => {}
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct PartyFlags {
    pub requester: bool,
    pub challenger: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct Organization {
    pub id: BytesN<32>,
    pub status: Status,
    pub requester: Address,
    pub last_status_change: u64,
    pub lif_stake: i128,
    /// 0 means no withdrawal has been requested.
    pub withdrawal_request_time: u64,
}

/// One challenge-to-resolution cycle. The arbitrator and its extra data are
/// snapshotted at creation so later governance changes never affect an
/// in-flight dispute.
#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct Challenge {
    pub disputed: bool,
    pub dispute_id: u64,
    pub resolved: bool,
    pub challenger: Address,
    pub num_rounds: u32,
    pub ruling: Party,
    pub arbitrator: Address,
    pub arbitrator_extra_data: Bytes,
    pub meta_evidence_id: u32,
}

/// Fee accounting for one funding round. Round 0 is the initial challenge
/// funding; rounds >= 1 are appeal rounds. Per-contributor amounts live
/// under their own storage key.
#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct Round {
    pub paid_fees: PartyAmounts,
    pub has_paid: PartyFlags,
    pub fee_rewards: i128,
}

/// Deposit, timeout and appeal-stake parameters, grouped so `initialize`
/// takes one value for all of them.
#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct DirectoryParams {
    pub requester_deposit: i128,
    pub challenge_base_deposit: i128,
    pub execution_timeout: u64,
    pub response_timeout: u64,
    pub withdraw_timeout: u64,
    pub shared_stake_multiplier: i128,
    pub winner_stake_multiplier: i128,
    pub loser_stake_multiplier: i128,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[contracttype]
pub struct DirectoryConfig {
    pub governor: Address,
    pub segment: String,
    pub org_id: Address,
    pub lif: Address,
    pub fee_token: Address,
    pub arbitrator: Address,
    pub arbitrator_extra_data: Bytes,
    pub requester_deposit: i128,
    pub challenge_base_deposit: i128,
    pub execution_timeout: u64,
    pub response_timeout: u64,
    pub withdraw_timeout: u64,
    pub shared_stake_multiplier: i128,
    pub winner_stake_multiplier: i128,
    pub loser_stake_multiplier: i128,
    pub meta_evidence_updates: u32,
}

#[derive(Clone)]
#[contracttype]
pub enum DataKey {
    Config,
    Org(BytesN<32>),
    ChallengeCount(BytesN<32>),
    Challenge(BytesN<32>, u32),
    Round(BytesN<32>, u32, u32),
    Contribution(BytesN<32>, u32, u32, Address),
    Registered,
    RegisteredIndex(BytesN<32>),
    Requested,
    RequestedIndex(BytesN<32>),
    DisputeToOrg(Address, u64),
}
