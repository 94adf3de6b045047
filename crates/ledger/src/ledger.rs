//! The ledger proper.

use crate::account::Account;
use crate::escrow::{EscrowId, EscrowRow, EscrowState};
use agora_types::error::LedgerError;
use agora_types::{codec, AgentId};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A signed instruction to create credits. There is no other way credits
/// come into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MintOrder {
    pub to: AgentId,
    pub amount: u64,
    /// Replay protection; each minter's orders must be strictly increasing.
    pub nonce: u64,
}

impl MintOrder {
    /// Canonical bytes the minter signs.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        codec::to_bytes_canonical(self).map_err(|_| LedgerError::UnauthorizedMint)
    }
}

/// The node-local ledger. Mutations are serialized by ownership (`&mut`);
/// cross-step atomicity comes from [`Ledger::transaction`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<AgentId, Account>,
    escrows: BTreeMap<EscrowId, EscrowRow>,
    /// Agents whose signatures authorize minting, fixed at genesis.
    minters: BTreeSet<AgentId>,
    /// Minter replay floors.
    mint_nonces: BTreeMap<AgentId, u64>,
    minted_total: u64,
    burned_total: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a genesis minter. Only callable before any mint happened,
    /// so a running ledger's authorization set is immutable.
    pub fn register_minter(&mut self, minter: AgentId) -> Result<(), LedgerError> {
        if self.minted_total > 0 {
            return Err(LedgerError::UnauthorizedMint);
        }
        self.minters.insert(minter);
        Ok(())
    }

    pub fn account(&self, id: &AgentId) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn balance(&self, id: &AgentId) -> u64 {
        self.accounts.get(id).map_or(0, |a| a.balance)
    }

    pub fn stake(&self, id: &AgentId) -> u64 {
        self.accounts.get(id).map_or(0, |a| a.stake)
    }

    pub fn reputation(&self, id: &AgentId) -> f32 {
        self.accounts.get(id).map_or(0.0, |a| a.reputation)
    }

    pub fn escrow(&self, id: &EscrowId) -> Option<&EscrowRow> {
        self.escrows.get(id)
    }

    pub fn burned_total(&self) -> u64 {
        self.burned_total
    }

    pub fn minted_total(&self) -> u64 {
        self.minted_total
    }

    fn account_mut(&mut self, id: AgentId) -> &mut Account {
        self.accounts.entry(id).or_default()
    }

    /// Runs `f` all-or-nothing: if it errs, no mutation survives.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut staged = self.clone();
        let out = f(&mut staged)?;
        *self = staged;
        Ok(out)
    }

    /// Creates credits against an authorized minter signature.
    pub fn mint(
        &mut self,
        order: &MintOrder,
        minter_pubkey: &[u8],
        signature: &[u8],
    ) -> Result<(), LedgerError> {
        let minter = agora_crypto::agent_id_from_pubkey(minter_pubkey)
            .map_err(|_| LedgerError::UnauthorizedMint)?;
        if !self.minters.contains(&minter) {
            return Err(LedgerError::UnauthorizedMint);
        }
        let floor = self.mint_nonces.get(&minter).copied().unwrap_or(0);
        if order.nonce <= floor {
            return Err(LedgerError::UnauthorizedMint);
        }
        let bytes = order.signing_bytes()?;
        agora_crypto::sign::verify_detached(minter_pubkey, &bytes, signature)
            .map_err(|_| LedgerError::UnauthorizedMint)?;

        let minted = self
            .minted_total
            .checked_add(order.amount)
            .ok_or(LedgerError::Overflow)?;
        let account = self.account_mut(order.to);
        account.balance = account
            .balance
            .checked_add(order.amount)
            .ok_or(LedgerError::Overflow)?;
        self.minted_total = minted;
        self.mint_nonces.insert(minter, order.nonce);
        info!(target: "ledger", to = %order.to, amount = order.amount, "minted");
        Ok(())
    }

    /// Moves credits between accounts.
    pub fn transfer(&mut self, from: AgentId, to: AgentId, amount: u64) -> Result<(), LedgerError> {
        let src = self
            .accounts
            .get_mut(&from)
            .ok_or(LedgerError::UnknownAccount(from))?;
        src.balance = src
            .balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientFunds {
                account: from,
                needed: amount,
                available: src.balance,
            })?;
        let dst = self.account_mut(to);
        dst.balance = dst.balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Bonds spendable credits as stake.
    pub fn bond_stake(&mut self, id: AgentId, amount: u64) -> Result<(), LedgerError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::UnknownAccount(id))?;
        account.balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientFunds {
                    account: id,
                    needed: amount,
                    available: account.balance,
                })?;
        account.stake = account.stake.checked_add(amount).ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Unbonds stake back into balance.
    pub fn release_stake(&mut self, id: AgentId, amount: u64) -> Result<(), LedgerError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::UnknownAccount(id))?;
        account.stake =
            account
                .stake
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientStake {
                    account: id,
                    needed: amount,
                    available: account.stake,
                })?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Debits the payer and locks the amount under `id`, atomically.
    ///
    /// A row whose previous lifecycle fully settled (released or refunded)
    /// may be re-locked for a retry; a still-locked row may not.
    pub fn escrow_lock(
        &mut self,
        id: EscrowId,
        payer: AgentId,
        amount: u64,
    ) -> Result<(), LedgerError> {
        if self
            .escrows
            .get(&id)
            .is_some_and(|row| row.state == EscrowState::Locked)
        {
            return Err(LedgerError::AlreadyReleased);
        }
        let account = self
            .accounts
            .get_mut(&payer)
            .ok_or(LedgerError::UnknownAccount(payer))?;
        account.balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientFunds {
                    account: payer,
                    needed: amount,
                    available: account.balance,
                })?;
        self.escrows.insert(
            id,
            EscrowRow {
                amount,
                payer,
                state: EscrowState::Locked,
            },
        );
        debug!(target: "ledger", ?id, amount, "escrow locked");
        Ok(())
    }

    /// One-shot state flip on an escrow row. The compare-and-set on
    /// `Locked` is what makes releases race-safe.
    fn take_locked(&mut self, id: &EscrowId) -> Result<u64, LedgerError> {
        let row = self.escrows.get_mut(id).ok_or(LedgerError::EscrowNotFound)?;
        if row.state != EscrowState::Locked {
            return Err(LedgerError::AlreadyReleased);
        }
        row.state = EscrowState::Released;
        Ok(row.amount)
    }

    /// Releases a locked escrow to a single recipient.
    pub fn escrow_release(&mut self, id: &EscrowId, to: AgentId) -> Result<u64, LedgerError> {
        self.transaction(|l| {
            let amount = l.take_locked(id)?;
            let dst = l.account_mut(to);
            dst.balance = dst.balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
            Ok(amount)
        })
    }

    /// Releases a locked escrow split across `shares` in basis points.
    /// Shares must not exceed 10 000; any unallocated remainder is burned.
    pub fn escrow_release_split(
        &mut self,
        id: &EscrowId,
        shares: &[(AgentId, u16)],
    ) -> Result<u64, LedgerError> {
        let total_bps: u32 = shares.iter().map(|(_, bps)| u32::from(*bps)).sum();
        if total_bps > 10_000 {
            return Err(LedgerError::InvalidSplit(format!(
                "shares sum to {} bps",
                total_bps
            )));
        }
        self.transaction(|l| {
            let amount = l.take_locked(id)?;
            let mut paid: u64 = 0;
            for (to, bps) in shares {
                let cut = amount
                    .checked_mul(u64::from(*bps))
                    .ok_or(LedgerError::Overflow)?
                    / 10_000;
                let dst = l.account_mut(*to);
                dst.balance = dst.balance.checked_add(cut).ok_or(LedgerError::Overflow)?;
                paid = paid.checked_add(cut).ok_or(LedgerError::Overflow)?;
            }
            // Rounding dust and any unallocated share are burned, keeping
            // the conservation sum intact.
            let burn = amount.checked_sub(paid).ok_or(LedgerError::Overflow)?;
            l.burned_total = l.burned_total.checked_add(burn).ok_or(LedgerError::Overflow)?;
            Ok(amount)
        })
    }

    /// Refunds a locked escrow to its payer (TTL expiry path).
    pub fn escrow_refund(&mut self, id: &EscrowId) -> Result<u64, LedgerError> {
        self.transaction(|l| {
            let row = l.escrows.get_mut(id).ok_or(LedgerError::EscrowNotFound)?;
            if row.state != EscrowState::Locked {
                return Err(LedgerError::AlreadyReleased);
            }
            row.state = EscrowState::Refunded;
            let amount = row.amount;
            let payer = row.payer;
            let dst = l.account_mut(payer);
            dst.balance = dst.balance.checked_add(amount).ok_or(LedgerError::Overflow)?;
            Ok(amount)
        })
    }

    /// Slashes up to `amount` from an account's stake; returns what was
    /// actually debited. The caller decides where the forfeit goes via
    /// [`Ledger::distribute_forfeit`].
    pub fn slash_stake(&mut self, id: AgentId, amount: u64) -> Result<u64, LedgerError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::UnknownAccount(id))?;
        let debit = account.stake.min(amount);
        account.stake -= debit;
        info!(target: "ledger", account = %id, debit, "stake slashed");
        Ok(debit)
    }

    /// Distributes a forfeited sum per a basis-point split: challenger
    /// share, equal division of the honest share, and the burn share
    /// (which also absorbs rounding dust).
    pub fn distribute_forfeit(
        &mut self,
        amount: u64,
        challenger: AgentId,
        challenger_bps: u16,
        honest: &[AgentId],
        honest_bps: u16,
    ) -> Result<(), LedgerError> {
        let split_sum = u32::from(challenger_bps) + u32::from(honest_bps);
        if split_sum > 10_000 {
            return Err(LedgerError::InvalidSplit(format!(
                "split sums to {} bps",
                split_sum
            )));
        }
        self.transaction(|l| {
            let challenger_cut =
                amount.checked_mul(u64::from(challenger_bps)).ok_or(LedgerError::Overflow)?
                    / 10_000;
            let honest_pool =
                amount.checked_mul(u64::from(honest_bps)).ok_or(LedgerError::Overflow)? / 10_000;

            let dst = l.account_mut(challenger);
            dst.balance = dst
                .balance
                .checked_add(challenger_cut)
                .ok_or(LedgerError::Overflow)?;

            let mut paid = challenger_cut;
            if !honest.is_empty() {
                let per_head = honest_pool / honest.len() as u64;
                for id in honest {
                    let dst = l.account_mut(*id);
                    dst.balance = dst
                        .balance
                        .checked_add(per_head)
                        .ok_or(LedgerError::Overflow)?;
                    paid = paid.checked_add(per_head).ok_or(LedgerError::Overflow)?;
                }
            }
            let burn = amount.checked_sub(paid).ok_or(LedgerError::Overflow)?;
            l.burned_total = l.burned_total.checked_add(burn).ok_or(LedgerError::Overflow)?;
            Ok(())
        })
    }

    /// Nudges reputation, clamped to `[0, 10]`.
    pub fn adjust_reputation(&mut self, id: AgentId, delta: f32) {
        let account = self.account_mut(id);
        account.reputation = (account.reputation + delta).clamp(0.0, 10.0);
    }

    /// The conservation law: wealth + locked escrow + burned == minted.
    pub fn check_conservation(&self) -> Result<(), LedgerError> {
        let mut sum: u64 = 0;
        for account in self.accounts.values() {
            sum = sum.checked_add(account.wealth()).ok_or(LedgerError::Overflow)?;
        }
        for row in self.escrows.values() {
            if row.state == EscrowState::Locked {
                sum = sum.checked_add(row.amount).ok_or(LedgerError::Overflow)?;
            }
        }
        sum = sum.checked_add(self.burned_total).ok_or(LedgerError::Overflow)?;
        if sum != self.minted_total {
            return Err(LedgerError::InvalidSplit(format!(
                "conservation violated: {} accounted vs {} minted",
                sum, self.minted_total
            )));
        }
        Ok(())
    }
}
