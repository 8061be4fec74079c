//! Simulation engine (`sim-engine` feature)
//!
//! A deterministic, simplified hold'em engine that satisfies the
//! [`Engine`](crate::engine::Engine) contract: seating, blinds, street
//! progression, fold-out and showdown completion, rake, time bank and
//! blind levels. Card play is intentionally trivial (deterministic hole
//! card labels, lowest surviving seat wins a showdown) - the orchestrator
//! never looks inside, and tests need reproducible outcomes, not poker.
//!
//! Production deployments plug a real rules engine into the same trait
//! and disable this feature.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;

use crate::config::{TableConfig, TableMode};
use crate::core_types::{Amount, SeatIdx, UserId};
use crate::engine::{
    Action, ActionType, Engine, EngineError, EngineFactory, EngineStatus, HistoryFormat,
    PlayerInfo, Street, WinnerInfo,
};
use crate::store::TableSnapshot;

// Stable rejection codes forwarded through the orchestrator.
mod codes {
    pub const SEAT_TAKEN: &str = "SEAT_TAKEN";
    pub const SEAT_OUT_OF_RANGE: &str = "SEAT_OUT_OF_RANGE";
    pub const SEAT_RESERVED: &str = "SEAT_RESERVED";
    pub const ALREADY_SEATED: &str = "ALREADY_SEATED";
    pub const NOT_SEATED: &str = "NOT_SEATED";
    pub const NOT_YOUR_TURN: &str = "NOT_YOUR_TURN";
    pub const NOT_ENOUGH_PLAYERS: &str = "NOT_ENOUGH_PLAYERS";
    pub const HAND_IN_PROGRESS: &str = "HAND_IN_PROGRESS";
    pub const NO_HAND_IN_PROGRESS: &str = "NO_HAND_IN_PROGRESS";
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const INVALID_AMOUNT: &str = "INVALID_AMOUNT";
    pub const CANNOT_CHECK: &str = "CANNOT_CHECK";
    pub const NOTHING_TO_CALL: &str = "NOTHING_TO_CALL";
    pub const BET_ALREADY_OPEN: &str = "BET_ALREADY_OPEN";
    pub const NO_BET_TO_RAISE: &str = "NO_BET_TO_RAISE";
    pub const RAISE_TOO_SMALL: &str = "RAISE_TOO_SMALL";
    pub const NO_TIME_BANK: &str = "NO_TIME_BANK";
    pub const NOT_TOURNAMENT: &str = "NOT_TOURNAMENT";
    pub const MAX_BLIND_LEVEL: &str = "MAX_BLIND_LEVEL";
    pub const NOT_AT_SHOWDOWN: &str = "NOT_AT_SHOWDOWN";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimSeat {
    user_id: UserId,
    stack: Amount,
    folded: bool,
    /// Dealt into the hand currently on the table.
    in_hand: bool,
    /// Chips committed on the current street.
    committed: Amount,
    hole: Option<[String; 2]>,
}

impl SimSeat {
    fn new(user_id: UserId, stack: Amount) -> Self {
        Self {
            user_id,
            stack,
            folded: false,
            in_hand: false,
            committed: 0,
            hole: None,
        }
    }

    fn live(&self) -> bool {
        self.in_hand && !self.folded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimState {
    config: TableConfig,
    seats: Vec<Option<SimSeat>>,
    reservations: Vec<Option<UserId>>,
    street: Street,
    button: usize,
    /// Seats still owing an action this street, front acts next.
    pending: VecDeque<usize>,
    current_bet: Amount,
    pot: Amount,
    winners: Option<Vec<WinnerInfo>>,
    rake_this_hand: Amount,
    hand_no: u64,
    blind_level: usize,
    time_bank_active_seat: Option<usize>,
    events: Vec<String>,
}

pub struct SimEngine {
    state: SimState,
}

impl SimEngine {
    pub fn new(config: &TableConfig) -> Self {
        let seats = config.max_players as usize;
        Self {
            state: SimState {
                config: config.clone(),
                seats: vec![None; seats],
                reservations: vec![None; seats],
                street: Street::Waiting,
                button: 0,
                pending: VecDeque::new(),
                current_bet: 0,
                pot: 0,
                winners: None,
                rake_this_hand: 0,
                hand_no: 0,
                blind_level: 0,
                time_bank_active_seat: None,
                events: Vec::new(),
            },
        }
    }

    fn invalid(code: &str, message: impl Into<String>) -> EngineError {
        EngineError::invalid(code, message)
    }

    fn hand_active(&self) -> bool {
        self.state.winners.is_none() && self.state.street != Street::Waiting
    }

    fn blinds(&self) -> (Amount, Amount) {
        if self.state.config.mode == TableMode::Tournament
            && let Some(levels) = &self.state.config.blind_levels
            && let Some(level) = levels.get(self.state.blind_level)
        {
            return (level.small_blind, level.big_blind);
        }
        (self.state.config.small_blind, self.state.config.big_blind)
    }

    fn seat_of(&self, user_id: UserId) -> Option<usize> {
        self.state
            .seats
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.user_id == user_id))
    }

    fn require_player(action: &Action) -> Result<UserId, EngineError> {
        action
            .player_id
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "player_id required"))
    }

    /// Seats eligible for the next hand, in table order.
    fn eligible_seats(&self) -> Vec<usize> {
        self.state
            .seats
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|s| s.stack > 0))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Live (dealt, unfolded) seats in table order.
    fn live_seats(&self) -> Vec<usize> {
        self.state
            .seats
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|s| s.live()))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Seats from `start` exclusive, wrapping, filtered by `filter`.
    fn order_after(&self, start: usize, filter: impl Fn(&SimSeat) -> bool) -> Vec<usize> {
        let n = self.state.seats.len();
        (1..=n)
            .map(|offset| (start + offset) % n)
            .filter(|&idx| self.state.seats[idx].as_ref().is_some_and(&filter))
            .collect()
    }

    fn seat_mut(&mut self, idx: usize) -> &mut SimSeat {
        self.state.seats[idx].as_mut().expect("seat occupied")
    }

    fn commit(&mut self, idx: usize, amount: Amount) -> Amount {
        let paid = amount.min(self.seat_mut(idx).stack);
        let seat = self.seat_mut(idx);
        seat.stack -= paid;
        seat.committed += paid;
        self.state.pot += paid;
        paid
    }

    fn push_event(&mut self, event: String) {
        self.state.events.push(event);
    }

    // --------------------------------------------------------
    // Actions
    // --------------------------------------------------------

    fn sit(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = action
            .seat
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "seat required"))?
            as usize;
        let stack = action
            .stack
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "stack required"))?;
        if seat >= self.state.seats.len() {
            return Err(Self::invalid(codes::SEAT_OUT_OF_RANGE, format!("seat {}", seat)));
        }
        if stack <= 0 {
            return Err(Self::invalid(codes::INVALID_AMOUNT, "stack must be positive"));
        }
        if self.state.seats[seat].is_some() {
            return Err(Self::invalid(codes::SEAT_TAKEN, format!("seat {}", seat)));
        }
        if self.seat_of(user_id).is_some() {
            return Err(Self::invalid(codes::ALREADY_SEATED, format!("user {}", user_id)));
        }
        if let Some(reserved_for) = self.state.reservations[seat]
            && reserved_for != user_id
        {
            return Err(Self::invalid(codes::SEAT_RESERVED, format!("seat {}", seat)));
        }
        self.state.reservations[seat] = None;
        self.state.seats[seat] = Some(SimSeat::new(user_id, stack));
        self.push_event(format!("SIT seat={} user={} stack={}", seat, user_id, stack));
        Ok(())
    }

    fn reserve_seat(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = action
            .seat
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "seat required"))?
            as usize;
        if seat >= self.state.seats.len() {
            return Err(Self::invalid(codes::SEAT_OUT_OF_RANGE, format!("seat {}", seat)));
        }
        if self.state.seats[seat].is_some() || self.state.reservations[seat].is_some() {
            return Err(Self::invalid(codes::SEAT_TAKEN, format!("seat {}", seat)));
        }
        self.state.reservations[seat] = Some(user_id);
        self.push_event(format!("RESERVE seat={} user={}", seat, user_id));
        Ok(())
    }

    fn stand(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self
            .seat_of(user_id)
            .ok_or_else(|| Self::invalid(codes::NOT_SEATED, format!("user {}", user_id)))?;
        if self.hand_active() && self.state.seats[seat].as_ref().unwrap().live() {
            self.fold_seat(seat);
        }
        self.state.seats[seat] = None;
        self.state.pending.retain(|&s| s != seat);
        self.push_event(format!("STAND seat={} user={}", seat, user_id));
        Ok(())
    }

    fn add_chips(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let amount = action
            .amount
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "amount required"))?;
        if amount <= 0 {
            return Err(Self::invalid(codes::INVALID_AMOUNT, "amount must be positive"));
        }
        let seat = self
            .seat_of(user_id)
            .ok_or_else(|| Self::invalid(codes::NOT_SEATED, format!("user {}", user_id)))?;
        if self.hand_active() && self.state.seats[seat].as_ref().unwrap().in_hand {
            return Err(Self::invalid(
                codes::HAND_IN_PROGRESS,
                "chips can be added between hands",
            ));
        }
        self.seat_mut(seat).stack += amount;
        self.push_event(format!("ADD_CHIPS seat={} amount={}", seat, amount));
        Ok(())
    }

    fn deal(&mut self) -> Result<(), EngineError> {
        if self.hand_active() {
            return Err(Self::invalid(codes::HAND_IN_PROGRESS, "hand already running"));
        }
        let eligible = self.eligible_seats();
        if eligible.len() < 2 {
            return Err(Self::invalid(
                codes::NOT_ENOUGH_PLAYERS,
                format!("{} players with chips", eligible.len()),
            ));
        }

        self.state.hand_no += 1;
        self.state.winners = None;
        self.state.rake_this_hand = 0;
        self.state.pot = 0;
        let hand_no = self.state.hand_no;

        for idx in 0..self.state.seats.len() {
            if let Some(seat) = self.state.seats[idx].as_mut() {
                let playing = seat.stack > 0;
                seat.in_hand = playing;
                seat.folded = false;
                seat.committed = 0;
                seat.hole = playing.then(|| {
                    [
                        format!("c{}-{}a", hand_no, idx),
                        format!("c{}-{}b", hand_no, idx),
                    ]
                });
            }
        }

        // Button moves to the next eligible seat; blinds follow it.
        self.state.button = self.order_after(self.state.button, |s| s.stack > 0 || s.in_hand)[0];
        let (small_blind, big_blind) = self.blinds();
        let after_button = self.order_after(self.state.button, |s| s.in_hand);
        let sb_seat = after_button[0];
        let bb_seat = after_button[1 % after_button.len()];
        self.commit(sb_seat, small_blind);
        self.commit(bb_seat, big_blind);
        self.state.current_bet = big_blind;
        self.state.street = Street::Preflop;
        self.state.time_bank_active_seat = None;
        self.state.pending = self
            .order_after(bb_seat, |s| s.live() && s.stack > 0)
            .into_iter()
            .collect();
        self.push_event(format!(
            "DEAL hand={} button={} sb={} bb={}",
            hand_no, self.state.button, sb_seat, bb_seat
        ));
        if self.state.pending.is_empty() {
            // Both blinds are all-in; nobody can act, run the hand out.
            self.advance_street();
        }
        Ok(())
    }

    /// Seat index of the next actor, validated against the acting player.
    fn turn_seat(&self, user_id: UserId) -> Result<usize, EngineError> {
        if !self.hand_active() {
            return Err(Self::invalid(codes::NO_HAND_IN_PROGRESS, "no hand running"));
        }
        let seat = self
            .seat_of(user_id)
            .ok_or_else(|| Self::invalid(codes::NOT_SEATED, format!("user {}", user_id)))?;
        match self.state.pending.front() {
            Some(&next) if next == seat => Ok(seat),
            _ => Err(Self::invalid(
                codes::NOT_YOUR_TURN,
                format!("user {} is not the next actor", user_id),
            )),
        }
    }

    fn fold_seat(&mut self, seat: usize) {
        self.seat_mut(seat).folded = true;
        self.state.pending.retain(|&s| s != seat);
        self.push_event(format!("FOLD seat={}", seat));
        if self.live_seats().len() == 1 {
            self.finish_hand();
        } else if self.state.pending.is_empty() {
            self.advance_street();
        }
    }

    fn fold(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        self.fold_seat(seat);
        Ok(())
    }

    fn check(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        if self.state.seats[seat].as_ref().unwrap().committed != self.state.current_bet {
            return Err(Self::invalid(codes::CANNOT_CHECK, "facing a bet"));
        }
        self.state.pending.pop_front();
        self.push_event(format!("CHECK seat={}", seat));
        if self.state.pending.is_empty() {
            self.advance_street();
        }
        Ok(())
    }

    fn call(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        let owed = self.state.current_bet - self.state.seats[seat].as_ref().unwrap().committed;
        if owed <= 0 {
            return Err(Self::invalid(codes::NOTHING_TO_CALL, "no bet to call"));
        }
        let paid = self.commit(seat, owed);
        self.state.pending.pop_front();
        self.push_event(format!("CALL seat={} paid={}", seat, paid));
        if self.state.pending.is_empty() {
            self.advance_street();
        }
        Ok(())
    }

    fn bet(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        let amount = action
            .amount
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "amount required"))?;
        if self.state.current_bet > 0 {
            return Err(Self::invalid(codes::BET_ALREADY_OPEN, "raise instead"));
        }
        let (_, big_blind) = self.blinds();
        if amount < big_blind {
            return Err(Self::invalid(
                codes::INVALID_AMOUNT,
                format!("minimum bet is {}", big_blind),
            ));
        }
        self.commit(seat, amount);
        self.state.current_bet = amount;
        self.reopen_action(seat);
        self.push_event(format!("BET seat={} amount={}", seat, amount));
        Ok(())
    }

    fn raise(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        let amount = action
            .amount
            .ok_or_else(|| Self::invalid(codes::MISSING_FIELD, "amount required"))?;
        if self.state.current_bet == 0 {
            return Err(Self::invalid(codes::NO_BET_TO_RAISE, "bet instead"));
        }
        if amount <= self.state.current_bet {
            return Err(Self::invalid(
                codes::RAISE_TOO_SMALL,
                format!("raise must exceed {}", self.state.current_bet),
            ));
        }
        let committed = self.state.seats[seat].as_ref().unwrap().committed;
        self.commit(seat, amount - committed);
        self.state.current_bet = amount;
        self.reopen_action(seat);
        self.push_event(format!("RAISE seat={} to={}", seat, amount));
        Ok(())
    }

    /// A bet or raise puts every other live seat back on the clock.
    fn reopen_action(&mut self, aggressor: usize) {
        self.state.pending = self
            .order_after(aggressor, |s| s.live() && s.stack > 0)
            .into_iter()
            .filter(|&s| s != aggressor)
            .collect();
        if self.state.pending.is_empty() {
            // Everyone else is all-in; run the remaining streets out.
            self.advance_street();
        }
    }

    fn show_or_muck(&mut self, action: &Action, kind: &str) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self
            .seat_of(user_id)
            .ok_or_else(|| Self::invalid(codes::NOT_SEATED, format!("user {}", user_id)))?;
        if self.state.street != Street::Showdown {
            return Err(Self::invalid(codes::NOT_AT_SHOWDOWN, "hand not complete"));
        }
        if kind == "MUCK" {
            self.seat_mut(seat).hole = None;
        }
        self.push_event(format!("{} seat={}", kind, seat));
        Ok(())
    }

    fn time_bank(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        if self.state.config.time_bank_secs.is_none() {
            return Err(Self::invalid(codes::NO_TIME_BANK, "table has no time bank"));
        }
        self.state.time_bank_active_seat = Some(seat);
        self.push_event(format!("TIME_BANK seat={}", seat));
        Ok(())
    }

    fn timeout(&mut self, action: &Action) -> Result<(), EngineError> {
        let user_id = Self::require_player(action)?;
        let seat = self.turn_seat(user_id)?;
        self.push_event(format!("TIMEOUT seat={}", seat));
        self.fold_seat(seat);
        Ok(())
    }

    fn next_blind_level(&mut self) -> Result<(), EngineError> {
        if self.state.config.mode != TableMode::Tournament {
            return Err(Self::invalid(codes::NOT_TOURNAMENT, "cash table"));
        }
        let levels = self
            .state
            .config
            .blind_levels
            .as_ref()
            .map(|l| l.len())
            .unwrap_or(0);
        if self.state.blind_level + 1 >= levels {
            return Err(Self::invalid(codes::MAX_BLIND_LEVEL, "already at the last level"));
        }
        self.state.blind_level += 1;
        self.push_event(format!("BLIND_LEVEL level={}", self.state.blind_level));
        Ok(())
    }

    // --------------------------------------------------------
    // Hand progression
    // --------------------------------------------------------

    fn advance_street(&mut self) {
        if self.state.winners.is_some() {
            return;
        }
        let next = match self.state.street {
            Street::Preflop => Street::Flop,
            Street::Flop => Street::Turn,
            Street::Turn => Street::River,
            Street::River | Street::Showdown | Street::Waiting => {
                self.finish_hand();
                return;
            }
        };
        self.state.street = next;
        self.state.current_bet = 0;
        for seat in self.state.seats.iter_mut().flatten() {
            seat.committed = 0;
        }
        self.state.pending = self
            .order_after(self.state.button, |s| s.live() && s.stack > 0)
            .into_iter()
            .collect();
        self.push_event(format!("STREET {:?}", next));
        if self.state.pending.len() < 2 {
            // Nobody (or only one player) can act; run the hand out.
            self.advance_street();
        }
    }

    /// Award the pot and close the hand. The lowest surviving seat wins a
    /// showdown - a deliberate simulation shortcut.
    fn finish_hand(&mut self) {
        let live = self.live_seats();
        let winner_seat = match live.first() {
            Some(&seat) => seat,
            None => return,
        };

        let pot = self.state.pot;
        let rake = self.compute_rake(pot, live.len());
        let winnings = pot - rake;
        let winner = self.seat_mut(winner_seat);
        winner.stack += winnings;
        let winner_id = winner.user_id;

        self.state.pot = 0;
        self.state.rake_this_hand = rake;
        self.state.street = Street::Showdown;
        self.state.pending.clear();
        self.state.time_bank_active_seat = None;
        self.state.winners = Some(vec![WinnerInfo {
            user_id: winner_id,
            seat: winner_seat as SeatIdx,
            amount: winnings,
        }]);
        self.push_event(format!(
            "WIN seat={} user={} amount={} rake={}",
            winner_seat, winner_id, winnings, rake
        ));
    }

    fn compute_rake(&self, pot: Amount, contenders: usize) -> Amount {
        // No flop, no drop: a hand that never saw a flop is not raked.
        if self.state.config.rake_bps == 0 || contenders < 2 && self.state.street == Street::Preflop
        {
            return 0;
        }
        let raw = pot * self.state.config.rake_bps as Amount / 10_000;
        if self.state.config.rake_cap > 0 {
            raw.min(self.state.config.rake_cap)
        } else {
            raw
        }
    }
}

impl Engine for SimEngine {
    fn act(&mut self, action: &Action) -> Result<(), EngineError> {
        // Any action other than activating the time bank clears it.
        if action.kind != ActionType::TimeBank {
            self.state.time_bank_active_seat = None;
        }
        match action.kind {
            ActionType::Sit => self.sit(action),
            ActionType::Stand => self.stand(action),
            ActionType::AddChips => self.add_chips(action),
            ActionType::ReserveSeat => self.reserve_seat(action),
            ActionType::Deal => self.deal(),
            ActionType::Fold => self.fold(action),
            ActionType::Check => self.check(action),
            ActionType::Call => self.call(action),
            ActionType::Bet => self.bet(action),
            ActionType::Raise => self.raise(action),
            ActionType::Show => self.show_or_muck(action, "SHOW"),
            ActionType::Muck => self.show_or_muck(action, "MUCK"),
            ActionType::TimeBank => self.time_bank(action),
            ActionType::Timeout => self.timeout(action),
            ActionType::NextBlindLevel => self.next_blind_level(),
        }
    }

    fn status(&self) -> EngineStatus {
        let players = self
            .state
            .seats
            .iter()
            .enumerate()
            .filter_map(|(idx, seat)| {
                seat.as_ref().map(|s| PlayerInfo {
                    user_id: s.user_id,
                    seat: idx as SeatIdx,
                    stack: s.stack,
                    folded: s.folded,
                })
            })
            .collect();
        EngineStatus {
            players,
            street: self.state.street,
            action_to: self.state.pending.front().map(|&s| s as SeatIdx),
            winners: self.state.winners.clone(),
            rake_this_hand: self.state.rake_this_hand,
            config: self.state.config.clone(),
            time_bank_active_seat: self.state.time_bank_active_seat.map(|s| s as SeatIdx),
        }
    }

    fn snapshot(&self) -> Result<Value, EngineError> {
        serde_json::to_value(&self.state).map_err(|e| EngineError::Corrupt(e.to_string()))
    }

    fn view(&self, viewer: Option<UserId>) -> Value {
        let mut masked = self.state.clone();
        for seat in masked.seats.iter_mut().flatten() {
            if Some(seat.user_id) != viewer && seat.hole.is_some() {
                seat.hole = Some(["XX".to_string(), "XX".to_string()]);
            }
        }
        json!({
            "viewer": viewer,
            "table": serde_json::to_value(&masked).unwrap_or(Value::Null),
        })
    }

    fn history(&self, _format: HistoryFormat) -> Value {
        json!({
            "hand_no": self.state.hand_no,
            "events": self.state.events,
        })
    }
}

pub struct SimEngineFactory;

impl EngineFactory for SimEngineFactory {
    fn create(&self, config: &TableConfig) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(SimEngine::new(config)))
    }

    fn restore(&self, snapshot: &TableSnapshot) -> Result<Box<dyn Engine>, EngineError> {
        let state: SimState = serde_json::from_value(snapshot.state.clone())
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        Ok(Box::new(SimEngine { state }))
    }
}
