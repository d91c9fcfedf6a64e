#![no_std]
#![allow(clippy::too_many_arguments)]

//! Arbitrable segment directory.
//!
//! Organizations from an on-chain identity registry stake tokens to be
//! listed under a segment. Anyone can challenge a listing by depositing
//! arbitration fees; an accepted challenge escalates to an external
//! arbitrator and rulings can be contested through crowdfunded appeal
//! rounds. Fees of the winning side's funders are reimbursed with a reward
//! taken from the losing side.

mod types;


use soroban_sdk::{
    contract, contractimpl, symbol_short, token, vec, Address, Bytes, BytesN, Env, IntoVal,
    String, Symbol, Vec,
};

use crate::types::DataKey;
pub use crate::types::{
    Challenge, DirectoryConfig, DirectoryParams, Error, Organization, Party, PartyAmounts,
    PartyFlags, Round, Status,
};

/// Number of choices the arbitrator rules over: requester or challenger.
pub const RULING_OPTIONS: u32 = 2;
/// Divisor for the appeal stake multipliers, in basis points.
pub const MULTIPLIER_DIVISOR: i128 = 10_000;

#[contract]
pub struct ArbitrableDirectory;

fn now(env: &Env) -> u64 {
    env.ledger().timestamp()
}

fn zero_id(env: &Env) -> BytesN<32> {
    BytesN::from_array(env, &[0u8; 32])
}

fn load_config(env: &Env) -> Result<DirectoryConfig, Error> {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .ok_or(Error::NotInitialized)
}

fn save_config(env: &Env, config: &DirectoryConfig) {
    env.storage().instance().set(&DataKey::Config, config);
}

fn load_org(env: &Env, id: &BytesN<32>) -> Option<Organization> {
    env.storage().persistent().get(&DataKey::Org(id.clone()))
}

fn save_org(env: &Env, org: &Organization) {
    env.storage()
        .persistent()
        .set(&DataKey::Org(org.id.clone()), org);
}

fn challenge_count(env: &Env, id: &BytesN<32>) -> u32 {
    env.storage()
        .persistent()
        .get(&DataKey::ChallengeCount(id.clone()))
        .unwrap_or(0)
}

fn load_challenge(env: &Env, id: &BytesN<32>, challenge: u32) -> Result<Challenge, Error> {
    env.storage()
        .persistent()
        .get(&DataKey::Challenge(id.clone(), challenge))
        .ok_or(Error::ChallengeNotFound)
}

fn save_challenge(env: &Env, id: &BytesN<32>, challenge: u32, value: &Challenge) {
    env.storage()
        .persistent()
        .set(&DataKey::Challenge(id.clone(), challenge), value);
}

fn load_round(env: &Env, id: &BytesN<32>, challenge: u32, round: u32) -> Result<Round, Error> {
    env.storage()
        .persistent()
        .get(&DataKey::Round(id.clone(), challenge, round))
        .ok_or(Error::RoundNotFound)
}

fn save_round(env: &Env, id: &BytesN<32>, challenge: u32, round: u32, value: &Round) {
    env.storage()
        .persistent()
        .set(&DataKey::Round(id.clone(), challenge, round), value);
}

fn new_round() -> Round {
    Round {
        paid_fees: PartyAmounts::zero(),
        has_paid: PartyFlags {
            requester: false,
            challenger: false,
        },
        fee_rewards: 0,
    }
}

fn load_contribution(
    env: &Env,
    id: &BytesN<32>,
    challenge: u32,
    round: u32,
    contributor: &Address,
) -> PartyAmounts {
    env.storage()
        .persistent()
        .get(&DataKey::Contribution(
            id.clone(),
            challenge,
            round,
            contributor.clone(),
        ))
        .unwrap_or_else(PartyAmounts::zero)
}

fn save_contribution(
    env: &Env,
    id: &BytesN<32>,
    challenge: u32,
    round: u32,
    contributor: &Address,
    value: &PartyAmounts,
) {
    env.storage().persistent().set(
        &DataKey::Contribution(id.clone(), challenge, round, contributor.clone()),
        value,
    );
}

/// The two dense, order-unstable id lists: organizations currently listed
/// and organizations with an open request. Both are seeded with a zero
/// sentinel at position 0 so stored positions are 1-based and 0 can mean
/// "not present".
#[derive(Clone, Copy)]
enum ListKind {
    Registered,
    Requested,
}

impl ListKind {
    fn list_key(self) -> DataKey {
        match self {
            ListKind::Registered => DataKey::Registered,
            ListKind::Requested => DataKey::Requested,
        }
    }

    fn index_key(self, id: &BytesN<32>) -> DataKey {
        match self {
            ListKind::Registered => DataKey::RegisteredIndex(id.clone()),
            ListKind::Requested => DataKey::RequestedIndex(id.clone()),
        }
    }
}

fn load_list(env: &Env, list: ListKind) -> Vec<BytesN<32>> {
    env.storage()
        .persistent()
        .get(&list.list_key())
        .unwrap_or_else(|| vec![env, zero_id(env)])
}

fn list_position(env: &Env, list: ListKind, id: &BytesN<32>) -> u32 {
    env.storage()
        .persistent()
        .get(&list.index_key(id))
        .unwrap_or(0)
}

fn dense_add(env: &Env, list: ListKind, id: &BytesN<32>) -> u32 {
    let mut entries = load_list(env, list);
    let index = entries.len();
    entries.push_back(id.clone());
    env.storage().persistent().set(&list.list_key(), &entries);
    env.storage().persistent().set(&list.index_key(id), &index);
    index
}

/// Swap-with-last-then-pop removal keeping the list dense. Returns false if
/// the id was not present.
fn dense_remove(env: &Env, list: ListKind, id: &BytesN<32>) -> bool {
    let index = list_position(env, list, id);
    if index == 0 {
        return false;
    }
    let mut entries = load_list(env, list);
    let last_index = entries.len() - 1;
    if index != last_index {
        let last = entries.get_unchecked(last_index);
        entries.set(index, last.clone());
        env.storage().persistent().set(&list.index_key(&last), &index);
    }
    let _ = entries.pop_back();
    env.storage().persistent().set(&list.list_key(), &entries);
    env.storage().persistent().remove(&list.index_key(id));
    true
}

fn paginate(env: &Env, list: ListKind, cursor: u32, count: u32) -> Vec<BytesN<32>> {
    let entries = load_list(env, list);
    let mut out = Vec::new(env);
    let mut i = cursor.saturating_add(1);
    while i < entries.len() && (count == 0 || out.len() < count) {
        out.push_back(entries.get_unchecked(i));
        i += 1;
    }
    out
}

// Identity-registry queries.

fn org_exists(env: &Env, registry: &Address, id: &BytesN<32>) -> bool {
    env.invoke_contract(
        registry,
        &Symbol::new(env, "org_exists"),
        vec![env, id.into_val(env)],
    )
}

fn is_owner(env: &Env, registry: &Address, id: &BytesN<32>, account: &Address) -> bool {
    env.invoke_contract(
        registry,
        &Symbol::new(env, "is_owner"),
        vec![env, id.into_val(env), account.into_val(env)],
    )
}

fn is_director(env: &Env, registry: &Address, id: &BytesN<32>, account: &Address) -> bool {
    env.invoke_contract(
        registry,
        &Symbol::new(env, "is_director"),
        vec![env, id.into_val(env), account.into_val(env)],
    )
}

fn is_active(env: &Env, registry: &Address, id: &BytesN<32>) -> bool {
    env.invoke_contract(
        registry,
        &Symbol::new(env, "is_active"),
        vec![env, id.into_val(env)],
    )
}

// Arbitrator queries.

fn arbitration_cost(env: &Env, arbitrator: &Address, extra_data: &Bytes) -> i128 {
    env.invoke_contract(
        arbitrator,
        &Symbol::new(env, "arbitration_cost"),
        vec![env, extra_data.into_val(env)],
    )
}

fn appeal_cost(env: &Env, arbitrator: &Address, dispute_id: u64, extra_data: &Bytes) -> i128 {
    env.invoke_contract(
        arbitrator,
        &Symbol::new(env, "appeal_cost"),
        vec![env, dispute_id.into_val(env), extra_data.into_val(env)],
    )
}

fn appeal_period(env: &Env, arbitrator: &Address, dispute_id: u64) -> (u64, u64) {
    env.invoke_contract(
        arbitrator,
        &Symbol::new(env, "appeal_period"),
        vec![env, dispute_id.into_val(env)],
    )
}

fn current_ruling(env: &Env, arbitrator: &Address, dispute_id: u64) -> u32 {
    env.invoke_contract(
        arbitrator,
        &Symbol::new(env, "current_ruling"),
        vec![env, dispute_id.into_val(env)],
    )
}

fn party_from_ruling(ruling: u32) -> Party {
    match ruling {
        1 => Party::Requester,
        2 => Party::Challenger,
        _ => Party::None,
    }
}

fn evidence_group_id(env: &Env, id: &BytesN<32>, challenge_count: u32) -> BytesN<32> {
    let mut data = Bytes::from_array(env, &id.to_array());
    data.append(&Bytes::from_slice(env, &challenge_count.to_be_bytes()));
    env.crypto().sha256(&data).into()
}

/// Credits up to `total_required` of the given side with the contributor's
/// funds, pulling only the credited amount from them. The portion of `value`
/// above the requirement is simply never taken, which is how overpayments
/// are returned. No-op once the side is fully funded.
fn contribute(
    env: &Env,
    fee_token: &Address,
    id: &BytesN<32>,
    challenge: u32,
    round_index: u32,
    round: &mut Round,
    side: Party,
    contributor: &Address,
    value: i128,
    total_required: i128,
) -> Result<(), Error> {
    if value < 0 {
        return Err(Error::InvalidAmount);
    }
    let paid = round.paid_fees.get(side);
    let remaining = total_required.checked_sub(paid).ok_or(Error::Overflow)?;
    if remaining <= 0 {
        return Ok(());
    }
    let credited = if value < remaining { value } else { remaining };
    if credited == 0 {
        return Ok(());
    }
    token::Client::new(env, fee_token).transfer(
        contributor,
        &env.current_contract_address(),
        &credited,
    );
    let mut contribution = load_contribution(env, id, challenge, round_index, contributor);
    contribution.set(
        side,
        contribution
            .get(side)
            .checked_add(credited)
            .ok_or(Error::Overflow)?,
    );
    save_contribution(env, id, challenge, round_index, contributor, &contribution);
    round
        .paid_fees
        .set(side, paid.checked_add(credited).ok_or(Error::Overflow)?);
    round.fee_rewards = round
        .fee_rewards
        .checked_add(credited)
        .ok_or(Error::Overflow)?;
    Ok(())
}

/// Lists the organization, assigning a 1-based position if it does not have
/// one, and drops it from the open-request list.
fn register_organization(env: &Env, org: &mut Organization) {
    org.status = Status::Registered;
    org.last_status_change = now(env);
    if list_position(env, ListKind::Registered, &org.id) == 0 {
        let index = dense_add(env, ListKind::Registered, &org.id);
        env.events()
            .publish((symbol_short!("OrgAdded"), org.id.clone()), index);
    }
    dense_remove(env, ListKind::Requested, &org.id);
    save_org(env, org);
}

/// Clears the record back to Absent and drops the organization from both
/// lists. Stake transfers are the caller's concern and must happen after
/// this state is committed.
fn remove_organization(env: &Env, org: &mut Organization) {
    dense_remove(env, ListKind::Registered, &org.id);
    dense_remove(env, ListKind::Requested, &org.id);
    org.status = Status::Absent;
    org.lif_stake = 0;
    org.withdrawal_request_time = 0;
    org.last_status_change = now(env);
    save_org(env, org);
    env.events()
        .publish((symbol_short!("OrgRemove"), org.id.clone()), ());
}

fn execute_ruling(
    env: &Env,
    config: &DirectoryConfig,
    org: &mut Organization,
    challenge: &mut Challenge,
    winner: Party,
) {
    let lif = token::Client::new(env, &config.lif);
    let this = env.current_contract_address();
    match winner {
        Party::Requester => {
            if org.withdrawal_request_time == 0 {
                register_organization(env, org);
            } else {
                // The requester still wants out: hand the stake back.
                let stake = org.lif_stake;
                let requester = org.requester.clone();
                remove_organization(env, org);
                if stake > 0 {
                    lif.transfer(&this, &requester, &stake);
                }
            }
        }
        Party::Challenger => {
            let stake = org.lif_stake;
            let challenger = challenge.challenger.clone();
            remove_organization(env, org);
            if stake > 0 {
                lif.transfer(&this, &challenger, &stake);
            }
        }
        Party::None => {
            // No verdict: a listed organization stays listed with its stake,
            // an unlisted one is refunded and dropped.
            if list_position(env, ListKind::Registered, &org.id) != 0 {
                org.status = Status::Registered;
                org.last_status_change = now(env);
                save_org(env, org);
            } else {
                let stake = org.lif_stake;
                let requester = org.requester.clone();
                remove_organization(env, org);
                if stake > 0 {
                    lif.transfer(&this, &requester, &stake);
                }
            }
        }
    }
    challenge.resolved = true;
    challenge.ruling = winner;
}

fn fees_and_rewards(
    challenge: &Challenge,
    round: &Round,
    contribution: &PartyAmounts,
) -> Result<i128, Error> {
    if !challenge.resolved {
        return Err(Error::ChallengeNotResolved);
    }
    let reward = if !round.has_paid.requester || !round.has_paid.challenger {
        // Abortive round: everyone takes their own contributions back.
        contribution
            .requester
            .checked_add(contribution.challenger)
            .ok_or(Error::Overflow)?
    } else if challenge.ruling == Party::None {
        let total_paid = round
            .paid_fees
            .requester
            .checked_add(round.paid_fees.challenger)
            .ok_or(Error::Overflow)?;
        if total_paid > 0 {
            contribution
                .requester
                .checked_add(contribution.challenger)
                .ok_or(Error::Overflow)?
                .checked_mul(round.fee_rewards)
                .ok_or(Error::Overflow)?
                / total_paid
        } else {
            0
        }
    } else {
        let paid_winner = round.paid_fees.get(challenge.ruling);
        if paid_winner > 0 {
            contribution
                .get(challenge.ruling)
                .checked_mul(round.fee_rewards)
                .ok_or(Error::Overflow)?
                / paid_winner
        } else {
            0
        }
    };
    Ok(reward)
}

fn governor_auth(env: &Env) -> Result<DirectoryConfig, Error> {
    let config = load_config(env)?;
    config.governor.require_auth();
    Ok(config)
}

fn publish_param_change<V: IntoVal<Env, soroban_sdk::Val>>(env: &Env, param: Symbol, value: V) {
    env.events()
        .publish((symbol_short!("ParamChg"), param), value);
}

#[contractimpl]
impl ArbitrableDirectory {
    pub fn initialize(
        env: Env,
        governor: Address,
        segment: String,
        org_id: Address,
        lif: Address,
        fee_token: Address,
        arbitrator: Address,
        arbitrator_extra_data: Bytes,
        meta_evidence: String,
        params: DirectoryParams,
    ) -> Result<(), Error> {
        if env.storage().instance().has(&DataKey::Config) {
            return Err(Error::AlreadyInitialized);
        }
        let config = DirectoryConfig {
            governor,
            segment,
            org_id,
            lif,
            fee_token,
            arbitrator,
            arbitrator_extra_data,
            requester_deposit: params.requester_deposit,
            challenge_base_deposit: params.challenge_base_deposit,
            execution_timeout: params.execution_timeout,
            response_timeout: params.response_timeout,
            withdraw_timeout: params.withdraw_timeout,
            shared_stake_multiplier: params.shared_stake_multiplier,
            winner_stake_multiplier: params.winner_stake_multiplier,
            loser_stake_multiplier: params.loser_stake_multiplier,
            meta_evidence_updates: 0,
        };
        save_config(&env, &config);
        let sentinel = vec![&env, zero_id(&env)];
        env.storage().persistent().set(&DataKey::Registered, &sentinel);
        env.storage().persistent().set(&DataKey::Requested, &sentinel);
        env.events()
            .publish((symbol_short!("MetaEvid"),), (0u32, meta_evidence));
        Ok(())
    }

    /// Asks to list an organization. The caller must be its owner or
    /// confirmed director in the identity registry and the organization must
    /// be active there. Escrows the requester deposit.
    pub fn request_to_add(env: Env, id: BytesN<32>, requester: Address) -> Result<(), Error> {
        requester.require_auth();
        let config = load_config(&env)?;
        if let Some(org) = load_org(&env, &id) {
            if org.status != Status::Absent {
                return Err(Error::WrongStatus);
            }
        }
        if !org_exists(&env, &config.org_id, &id) {
            return Err(Error::OrganizationNotFound);
        }
        if !is_owner(&env, &config.org_id, &id, &requester)
            && !is_director(&env, &config.org_id, &id, &requester)
        {
            return Err(Error::NotOwnerOrDirector);
        }
        if !is_active(&env, &config.org_id, &id) {
            return Err(Error::OrganizationNotActive);
        }

        token::Client::new(&env, &config.lif).transfer(
            &requester,
            &env.current_contract_address(),
            &config.requester_deposit,
        );
        let org = Organization {
            id: id.clone(),
            status: Status::Registering,
            requester,
            last_status_change: now(&env),
            lif_stake: config.requester_deposit,
            withdrawal_request_time: 0,
        };
        save_org(&env, &org);
        if list_position(&env, ListKind::Requested, &id) == 0 {
            dense_add(&env, ListKind::Requested, &id);
        }
        Ok(())
    }

    /// Challenges a listed or registering organization. `value` must cover
    /// the arbitration cost plus the challenge base deposit in full.
    pub fn challenge_organization(
        env: Env,
        id: BytesN<32>,
        challenger: Address,
        evidence: String,
        value: i128,
    ) -> Result<(), Error> {
        challenger.require_auth();
        let config = load_config(&env)?;
        let mut org = load_org(&env, &id).ok_or(Error::NotChallengeable)?;
        match org.status {
            Status::Registering | Status::Registered => {}
            Status::WithdrawalRequested => {
                if now(&env).saturating_sub(org.withdrawal_request_time) > config.withdraw_timeout
                {
                    return Err(Error::WithdrawTimeoutPassed);
                }
            }
            _ => return Err(Error::NotChallengeable),
        }
        let cost = arbitration_cost(&env, &config.arbitrator, &config.arbitrator_extra_data);
        let total_cost = cost
            .checked_add(config.challenge_base_deposit)
            .ok_or(Error::Overflow)?;
        if value < total_cost {
            return Err(Error::InsufficientFunding);
        }

        let index = challenge_count(&env, &id);
        let challenge = Challenge {
            disputed: false,
            dispute_id: 0,
            resolved: false,
            challenger: challenger.clone(),
            num_rounds: 1,
            ruling: Party::None,
            arbitrator: config.arbitrator.clone(),
            arbitrator_extra_data: config.arbitrator_extra_data.clone(),
            meta_evidence_id: config.meta_evidence_updates,
        };
        let mut round = new_round();
        contribute(
            &env,
            &config.fee_token,
            &id,
            index,
            0,
            &mut round,
            Party::Challenger,
            &challenger,
            value,
            total_cost,
        )?;
        round.has_paid.challenger = true;
        save_challenge(&env, &id, index, &challenge);
        save_round(&env, &id, index, 0, &round);
        env.storage()
            .persistent()
            .set(&DataKey::ChallengeCount(id.clone()), &(index + 1));

        org.status = Status::Challenged;
        org.last_status_change = now(&env);
        save_org(&env, &org);

        env.events().publish(
            (symbol_short!("OrgChalng"), id.clone()),
            (challenger.clone(), index),
        );
        if evidence.len() > 0 {
            let group = evidence_group_id(&env, &id, index + 1);
            env.events().publish(
                (symbol_short!("Evidence"),),
                (config.arbitrator, group, challenger, evidence),
            );
        }
        Ok(())
    }

    /// Accepts an open challenge on the requester's behalf (any address may
    /// pay) and escalates to the snapshotted arbitrator.
    pub fn accept_challenge(
        env: Env,
        id: BytesN<32>,
        acceptor: Address,
        evidence: String,
        value: i128,
    ) -> Result<(), Error> {
        acceptor.require_auth();
        let config = load_config(&env)?;
        let mut org = load_org(&env, &id).ok_or(Error::NotChallenged)?;
        if org.status != Status::Challenged {
            return Err(Error::NotChallenged);
        }
        if now(&env).saturating_sub(org.last_status_change) > config.response_timeout {
            return Err(Error::ResponseTimeoutPassed);
        }
        let count = challenge_count(&env, &id);
        let challenge_index = count - 1;
        let mut challenge = load_challenge(&env, &id, challenge_index)?;
        let cost = arbitration_cost(&env, &challenge.arbitrator, &challenge.arbitrator_extra_data);
        let total_cost = cost
            .checked_add(config.challenge_base_deposit)
            .ok_or(Error::Overflow)?;
        if value < total_cost {
            return Err(Error::InsufficientFunding);
        }
        let mut round = load_round(&env, &id, challenge_index, 0)?;
        contribute(
            &env,
            &config.fee_token,
            &id,
            challenge_index,
            0,
            &mut round,
            Party::Requester,
            &acceptor,
            value,
            total_cost,
        )?;
        round.has_paid.requester = true;

        token::Client::new(&env, &config.fee_token).transfer(
            &env.current_contract_address(),
            &challenge.arbitrator,
            &cost,
        );
        let dispute_id: u64 = env.invoke_contract(
            &challenge.arbitrator,
            &Symbol::new(&env, "create_dispute"),
            vec![
                &env,
                RULING_OPTIONS.into_val(&env),
                (&challenge.arbitrator_extra_data).into_val(&env),
            ],
        );
        challenge.disputed = true;
        challenge.dispute_id = dispute_id;
        env.storage().persistent().set(
            &DataKey::DisputeToOrg(challenge.arbitrator.clone(), dispute_id),
            &id,
        );
        round.fee_rewards = round.fee_rewards.checked_sub(cost).ok_or(Error::Overflow)?;
        save_round(&env, &id, challenge_index, 0, &round);
        save_round(&env, &id, challenge_index, 1, &new_round());
        challenge.num_rounds = 2;
        save_challenge(&env, &id, challenge_index, &challenge);

        org.status = Status::Disputed;
        org.last_status_change = now(&env);
        save_org(&env, &org);

        let group = evidence_group_id(&env, &id, count);
        env.events().publish(
            (symbol_short!("Dispute"),),
            (
                challenge.arbitrator.clone(),
                dispute_id,
                challenge.meta_evidence_id,
                group.clone(),
            ),
        );
        if evidence.len() > 0 {
            env.events().publish(
                (symbol_short!("Evidence"),),
                (challenge.arbitrator, group, acceptor, evidence),
            );
        }
        Ok(())
    }

    /// Crowdfunds one side of the current appeal round. The side losing per
    /// the arbitrator's standing ruling may only fund during the first half
    /// of the appeal period. When both sides are fully funded the dispute is
    /// appealed and a fresh round is opened.
    pub fn fund_appeal(
        env: Env,
        id: BytesN<32>,
        side: Party,
        funder: Address,
        value: i128,
    ) -> Result<(), Error> {
        funder.require_auth();
        let config = load_config(&env)?;
        if side == Party::None {
            return Err(Error::InvalidParty);
        }
        let org = load_org(&env, &id).ok_or(Error::NoOpenDispute)?;
        if org.status != Status::Disputed {
            return Err(Error::NoOpenDispute);
        }
        let challenge_index = challenge_count(&env, &id) - 1;
        let mut challenge = load_challenge(&env, &id, challenge_index)?;
        let round_index = challenge.num_rounds - 1;
        let mut round = load_round(&env, &id, challenge_index, round_index)?;

        let (start, end) = appeal_period(&env, &challenge.arbitrator, challenge.dispute_id);
        let t = now(&env);
        if t < start || t >= end {
            return Err(Error::AppealPeriodOver);
        }
        let winner = party_from_ruling(current_ruling(
            &env,
            &challenge.arbitrator,
            challenge.dispute_id,
        ));
        let multiplier = if winner == Party::None {
            config.shared_stake_multiplier
        } else if side == winner {
            config.winner_stake_multiplier
        } else {
            let elapsed = t.saturating_sub(start);
            let period = end.saturating_sub(start);
            if elapsed.checked_mul(2).ok_or(Error::Overflow)? >= period {
                return Err(Error::LoserMustFundFirstHalf);
            }
            config.loser_stake_multiplier
        };
        let cost = appeal_cost(
            &env,
            &challenge.arbitrator,
            challenge.dispute_id,
            &challenge.arbitrator_extra_data,
        );
        let stake = cost.checked_mul(multiplier).ok_or(Error::Overflow)? / MULTIPLIER_DIVISOR;
        let total_cost = cost.checked_add(stake).ok_or(Error::Overflow)?;
        contribute(
            &env,
            &config.fee_token,
            &id,
            challenge_index,
            round_index,
            &mut round,
            side,
            &funder,
            value,
            total_cost,
        )?;
        if round.paid_fees.get(side) >= total_cost {
            match side {
                Party::Requester => round.has_paid.requester = true,
                Party::Challenger => round.has_paid.challenger = true,
                Party::None => {}
            }
        }

        if round.has_paid.requester && round.has_paid.challenger {
            // Both sides matched: escalate and carry the remainder over.
            token::Client::new(&env, &config.fee_token).transfer(
                &env.current_contract_address(),
                &challenge.arbitrator,
                &cost,
            );
            env.invoke_contract::<()>(
                &challenge.arbitrator,
                &Symbol::new(&env, "appeal"),
                vec![
                    &env,
                    challenge.dispute_id.into_val(&env),
                    (&challenge.arbitrator_extra_data).into_val(&env),
                ],
            );
            round.fee_rewards = round.fee_rewards.checked_sub(cost).ok_or(Error::Overflow)?;
            save_round(&env, &id, challenge_index, round_index, &round);
            save_round(&env, &id, challenge_index, round_index + 1, &new_round());
            challenge.num_rounds += 1;
            save_challenge(&env, &id, challenge_index, &challenge);
        } else {
            save_round(&env, &id, challenge_index, round_index, &round);
        }
        Ok(())
    }

    /// Settles whatever timeout has elapsed: finalizes an unchallenged
    /// registration, or resolves an unanswered challenge in the challenger's
    /// favor. Callable by anyone.
    pub fn execute_timeout(env: Env, id: BytesN<32>) -> Result<(), Error> {
        let config = load_config(&env)?;
        let mut org = load_org(&env, &id).ok_or(Error::NothingToExecute)?;
        match org.status {
            Status::Registering => {
                if now(&env).saturating_sub(org.last_status_change) <= config.execution_timeout {
                    return Err(Error::ExecutionTimeoutNotPassed);
                }
                register_organization(&env, &mut org);
            }
            Status::Challenged => {
                if now(&env).saturating_sub(org.last_status_change) <= config.response_timeout {
                    return Err(Error::ResponseTimeoutNotPassed);
                }
                // An ignored challenge defaults to the challenger: the stake
                // is forfeited and the round funds flow back through the
                // abortive-round withdrawal rule.
                let challenge_index = challenge_count(&env, &id) - 1;
                let mut challenge = load_challenge(&env, &id, challenge_index)?;
                challenge.resolved = true;
                challenge.ruling = Party::Challenger;
                save_challenge(&env, &id, challenge_index, &challenge);
                let stake = org.lif_stake;
                remove_organization(&env, &mut org);
                if stake > 0 {
                    token::Client::new(&env, &config.lif).transfer(
                        &env.current_contract_address(),
                        &challenge.challenger,
                        &stake,
                    );
                }
            }
            _ => return Err(Error::NothingToExecute),
        }
        Ok(())
    }

    /// Starts the stake-withdrawal timeout. The organization is delisted
    /// immediately but stays challengeable until the timeout passes.
    pub fn make_withdrawal_request(
        env: Env,
        id: BytesN<32>,
        caller: Address,
    ) -> Result<(), Error> {
        caller.require_auth();
        let config = load_config(&env)?;
        let mut org = load_org(&env, &id).ok_or(Error::WrongStatus)?;
        if org.status != Status::Registering && org.status != Status::Registered {
            return Err(Error::WrongStatus);
        }
        if !is_owner(&env, &config.org_id, &id, &caller)
            && !is_director(&env, &config.org_id, &id, &caller)
        {
            return Err(Error::NotOwnerOrDirector);
        }
        org.status = Status::WithdrawalRequested;
        org.withdrawal_request_time = now(&env);
        org.last_status_change = org.withdrawal_request_time;
        save_org(&env, &org);
        if dense_remove(&env, ListKind::Registered, &id) {
            env.events()
                .publish((symbol_short!("OrgRemove"), id.clone()), ());
        }
        Ok(())
    }

    /// Returns the stake to the requester once the withdrawal timeout has
    /// passed unchallenged. Callable by anyone.
    pub fn withdraw_tokens(env: Env, id: BytesN<32>) -> Result<(), Error> {
        let config = load_config(&env)?;
        let mut org = load_org(&env, &id).ok_or(Error::WrongStatus)?;
        if org.status != Status::WithdrawalRequested {
            return Err(Error::WrongStatus);
        }
        if now(&env).saturating_sub(org.withdrawal_request_time) <= config.withdraw_timeout {
            return Err(Error::WithdrawTimeoutNotPassed);
        }
        let stake = org.lif_stake;
        let requester = org.requester.clone();
        remove_organization(&env, &mut org);
        if stake > 0 {
            token::Client::new(&env, &config.lif).transfer(
                &env.current_contract_address(),
                &requester,
                &stake,
            );
        }
        Ok(())
    }

    /// Ruling callback. Only the arbitrator snapshotted by the challenge may
    /// deliver it. A side that fully funded the last appeal round alone wins
    /// outright regardless of the verdict.
    pub fn rule(env: Env, arbitrator: Address, dispute_id: u64, ruling: u32) -> Result<(), Error> {
        arbitrator.require_auth();
        let config = load_config(&env)?;
        if ruling > RULING_OPTIONS {
            return Err(Error::InvalidRuling);
        }
        let id: BytesN<32> = env
            .storage()
            .persistent()
            .get(&DataKey::DisputeToOrg(arbitrator.clone(), dispute_id))
            .ok_or(Error::DisputeNotFound)?;
        let mut org = load_org(&env, &id).ok_or(Error::DisputeNotFound)?;
        let challenge_index = challenge_count(&env, &id) - 1;
        let mut challenge = load_challenge(&env, &id, challenge_index)?;
        if challenge.arbitrator != arbitrator {
            return Err(Error::OnlyArbitrator);
        }
        if challenge.resolved {
            return Err(Error::ChallengeAlreadyResolved);
        }
        let last_round = load_round(&env, &id, challenge_index, challenge.num_rounds - 1)?;
        let mut winner = party_from_ruling(ruling);
        if last_round.has_paid.requester {
            winner = Party::Requester;
        } else if last_round.has_paid.challenger {
            winner = Party::Challenger;
        }
        env.events().publish(
            (symbol_short!("Ruling"),),
            (arbitrator, dispute_id, winner as u32),
        );
        execute_ruling(&env, &config, &mut org, &mut challenge, winner);
        save_challenge(&env, &id, challenge_index, &challenge);
        Ok(())
    }

    /// Emits an evidence pointer for the organization's current challenge
    /// cycle.
    pub fn submit_evidence(
        env: Env,
        id: BytesN<32>,
        party: Address,
        evidence: String,
    ) -> Result<(), Error> {
        party.require_auth();
        let config = load_config(&env)?;
        if load_org(&env, &id).is_none() {
            return Err(Error::NeverRequested);
        }
        let count = challenge_count(&env, &id);
        let arbitrator = if count > 0 {
            let challenge = load_challenge(&env, &id, count - 1)?;
            if challenge.resolved {
                return Err(Error::ChallengeAlreadyResolved);
            }
            if challenge.disputed {
                challenge.arbitrator
            } else {
                config.arbitrator
            }
        } else {
            config.arbitrator
        };
        let group = evidence_group_id(&env, &id, count);
        env.events()
            .publish((symbol_short!("Evidence"),), (arbitrator, group, party, evidence));
        Ok(())
    }

    /// Pays out the beneficiary's share of a resolved round's fee rewards.
    /// Callable by anyone on anyone's behalf; a repeated call pays zero.
    pub fn withdraw_fees_and_rewards(
        env: Env,
        beneficiary: Address,
        id: BytesN<32>,
        challenge: u32,
        round: u32,
    ) -> Result<i128, Error> {
        let config = load_config(&env)?;
        let challenge_data = load_challenge(&env, &id, challenge)?;
        let round_data = load_round(&env, &id, challenge, round)?;
        let contribution = load_contribution(&env, &id, challenge, round, &beneficiary);
        let reward = fees_and_rewards(&challenge_data, &round_data, &contribution)?;
        save_contribution(
            &env,
            &id,
            challenge,
            round,
            &beneficiary,
            &PartyAmounts::zero(),
        );
        if reward > 0 {
            token::Client::new(&env, &config.fee_token).transfer(
                &env.current_contract_address(),
                &beneficiary,
                &reward,
            );
        }
        Ok(reward)
    }

    // --- Read-only accessors ---

    pub fn get_config(env: Env) -> Result<DirectoryConfig, Error> {
        load_config(&env)
    }

    pub fn get_segment(env: Env) -> Result<String, Error> {
        Ok(load_config(&env)?.segment)
    }

    pub fn organization_data(env: Env, id: BytesN<32>) -> Option<Organization> {
        load_org(&env, &id)
    }

    pub fn get_number_of_challenges(env: Env, id: BytesN<32>) -> u32 {
        challenge_count(&env, &id)
    }

    pub fn get_challenge_info(env: Env, id: BytesN<32>, challenge: u32) -> Result<Challenge, Error> {
        load_challenge(&env, &id, challenge)
    }

    pub fn get_round_info(
        env: Env,
        id: BytesN<32>,
        challenge: u32,
        round: u32,
    ) -> Result<Round, Error> {
        load_round(&env, &id, challenge, round)
    }

    pub fn get_contributions(
        env: Env,
        id: BytesN<32>,
        challenge: u32,
        round: u32,
        contributor: Address,
    ) -> PartyAmounts {
        load_contribution(&env, &id, challenge, round, &contributor)
    }

    pub fn get_fees_and_rewards(
        env: Env,
        beneficiary: Address,
        id: BytesN<32>,
        challenge: u32,
        round: u32,
    ) -> Result<i128, Error> {
        let challenge_data = load_challenge(&env, &id, challenge)?;
        let round_data = load_round(&env, &id, challenge, round)?;
        let contribution = load_contribution(&env, &id, challenge, round, &beneficiary);
        fees_and_rewards(&challenge_data, &round_data, &contribution)
    }

    pub fn arbitrator_dispute_to_org(
        env: Env,
        arbitrator: Address,
        dispute_id: u64,
    ) -> Option<BytesN<32>> {
        env.storage()
            .persistent()
            .get(&DataKey::DisputeToOrg(arbitrator, dispute_id))
    }

    /// Raw read of the registered list; position 0 holds the zero sentinel.
    pub fn registered_organizations(env: Env, index: u32) -> BytesN<32> {
        let entries = load_list(&env, ListKind::Registered);
        entries.get(index).unwrap_or_else(|| zero_id(&env))
    }

    /// 1-based position in the registered list, 0 when not listed.
    pub fn organizations_index(env: Env, id: BytesN<32>) -> u32 {
        list_position(&env, ListKind::Registered, &id)
    }

    pub fn get_organizations(env: Env, cursor: u32, count: u32) -> Vec<BytesN<32>> {
        paginate(&env, ListKind::Registered, cursor, count)
    }

    pub fn get_organizations_count(env: Env, cursor: u32, count: u32) -> u32 {
        paginate(&env, ListKind::Registered, cursor, count).len()
    }

    pub fn get_requested_organizations(env: Env, cursor: u32, count: u32) -> Vec<BytesN<32>> {
        paginate(&env, ListKind::Requested, cursor, count)
    }

    pub fn get_requested_organizations_count(env: Env, cursor: u32, count: u32) -> u32 {
        paginate(&env, ListKind::Requested, cursor, count).len()
    }

    // --- Governance ---

    pub fn set_segment(env: Env, segment: String) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.segment = segment.clone();
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("segment"), segment);
        Ok(())
    }

    pub fn change_requester_deposit(env: Env, amount: i128) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.requester_deposit = amount;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("req_dep"), amount);
        Ok(())
    }

    pub fn change_challenge_base_deposit(env: Env, amount: i128) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.challenge_base_deposit = amount;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("chal_dep"), amount);
        Ok(())
    }

    pub fn change_execution_timeout(env: Env, timeout: u64) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.execution_timeout = timeout;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("exec_to"), timeout);
        Ok(())
    }

    pub fn change_response_timeout(env: Env, timeout: u64) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.response_timeout = timeout;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("resp_to"), timeout);
        Ok(())
    }

    pub fn change_withdraw_timeout(env: Env, timeout: u64) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.withdraw_timeout = timeout;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("wdraw_to"), timeout);
        Ok(())
    }

    pub fn change_shared_stake_multiplier(env: Env, multiplier: i128) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.shared_stake_multiplier = multiplier;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("shared_m"), multiplier);
        Ok(())
    }

    pub fn change_winner_stake_multiplier(env: Env, multiplier: i128) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.winner_stake_multiplier = multiplier;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("winner_m"), multiplier);
        Ok(())
    }

    pub fn change_loser_stake_multiplier(env: Env, multiplier: i128) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.loser_stake_multiplier = multiplier;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("loser_m"), multiplier);
        Ok(())
    }

    /// Points new challenges at a different arbitrator. Challenges already
    /// opened keep their snapshot.
    pub fn change_arbitrator(
        env: Env,
        arbitrator: Address,
        extra_data: Bytes,
    ) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.arbitrator = arbitrator.clone();
        config.arbitrator_extra_data = extra_data;
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("arbitratr"), arbitrator);
        Ok(())
    }

    pub fn change_meta_evidence(env: Env, meta_evidence: String) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.meta_evidence_updates += 1;
        save_config(&env, &config);
        env.events().publish(
            (symbol_short!("MetaEvid"),),
            (config.meta_evidence_updates, meta_evidence),
        );
        Ok(())
    }

    pub fn change_governor(env: Env, governor: Address) -> Result<(), Error> {
        let mut config = governor_auth(&env)?;
        config.governor = governor.clone();
        save_config(&env, &config);
        publish_param_change(&env, symbol_short!("governor"), governor);
        Ok(())
    }
}
