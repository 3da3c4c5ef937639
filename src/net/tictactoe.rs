//! Tic-tac-toe engine: shared turn counter, out-of-order recovery, idle GC.
//!
//! Both players share one monotonically increasing turn counter starting
//! at 1; `X` owns odd turns, `O` owns even turns, and the inviter picks
//! which symbol is theirs. Inbound moves are classified against the
//! expected turn: stale turns are duplicates (re-ACK only), future turns
//! are held while the gap is re-requested, and the expected turn applies
//! immediately and then drains any held successors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

pub const WINNING_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    pub fn as_char(&self) -> char {
        match self {
            Symbol::X => 'X',
            Symbol::O => 'O',
        }
    }

    pub fn from_char(c: char) -> Option<Symbol> {
        match c {
            'X' => Some(Symbol::X),
            'O' => Some(Symbol::O),
            _ => None,
        }
    }

    pub fn other(&self) -> Symbol {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }

    /// Who plays turn `t`: X owns odd turns, O owns even turns.
    pub fn for_turn(turn: u32) -> Symbol {
        if turn % 2 == 1 { Symbol::X } else { Symbol::O }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Win(Symbol),
    Draw,
}

impl GameResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameResult::Win(Symbol::X) => "X",
            GameResult::Win(Symbol::O) => "O",
            GameResult::Draw => "DRAW",
        }
    }
}

/// One move that has been applied to the board.
#[derive(Debug, Clone, Copy)]
pub struct AppliedMove {
    pub turn: u32,
    pub position: u8,
    pub symbol: Symbol,
}

#[derive(Debug, Clone, Copy)]
struct HeldMove {
    position: u8,
    symbol: Symbol,
}

/// How the engine disposed of one inbound move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Applied (possibly draining held successors). Carries the finished
    /// verdict when the move ended the game.
    Applied { finished: Option<(String, String)> },
    /// Already seen; the sender needs a fresh ACK and nothing else.
    Duplicate,
    /// Ahead of the expected turn; held. The gap `expected..=turn-1`
    /// needs a TICTACTOE_MOVE_REQUEST.
    Held { expected: u32 },
    /// Structurally impossible (occupied cell, wrong symbol for the turn,
    /// sender not in the game). Dropped.
    Rejected(&'static str),
}

pub struct Game {
    pub board: [Option<Symbol>; 9],
    /// canonical user_id → assigned symbol
    pub players: HashMap<String, Symbol>,
    /// Next expected turn; starts at 1 and increments on every application.
    pub turn: u32,
    last_activity: Instant,
    received_turns: HashSet<u32>,
    history: Vec<AppliedMove>,
    held: BTreeMap<u32, HeldMove>,
}

impl Game {
    pub fn new(player_a: &str, symbol_a: Symbol, player_b: &str) -> Self {
        let mut players = HashMap::new();
        players.insert(player_a.to_string(), symbol_a);
        players.insert(player_b.to_string(), symbol_a.other());
        Self {
            board: [None; 9],
            players,
            turn: 1,
            last_activity: Instant::now(),
            received_turns: HashSet::new(),
            history: Vec::new(),
            held: BTreeMap::new(),
        }
    }

    /// Rebuild a game from a TICTACTOE_STATE_RESPONSE snapshot.
    pub fn from_snapshot(
        board: &str,
        turn: u32,
        peer: &str,
        peer_symbol: Symbol,
        me: &str,
    ) -> Option<Self> {
        let mut game = Game::new(peer, peer_symbol, me);
        let cells: Vec<char> = board.chars().collect();
        if cells.len() != 9 {
            return None;
        }
        for (i, c) in cells.iter().enumerate() {
            game.board[i] = match c {
                '.' => None,
                _ => Some(Symbol::from_char(*c)?),
            };
        }
        game.turn = turn.max(1);
        Some(game)
    }

    pub fn symbol_of(&self, user_id: &str) -> Option<Symbol> {
        self.players.get(user_id).copied()
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&str> {
        self.players
            .keys()
            .find(|p| p.as_str() != user_id)
            .map(String::as_str)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    /// Nine characters over `X`/`O`/`.`, row-major.
    pub fn board_string(&self) -> String {
        self.board
            .iter()
            .map(|c| c.map(|s| s.as_char()).unwrap_or('.'))
            .collect()
    }

    pub fn winner(&self) -> Option<(GameResult, Option<[usize; 3]>)> {
        for line in WINNING_LINES {
            if let Some(s) = self.board[line[0]] {
                if self.board[line[1]] == Some(s) && self.board[line[2]] == Some(s) {
                    return Some((GameResult::Win(s), Some(line)));
                }
            }
        }
        if self.board.iter().all(Option::is_some) {
            return Some((GameResult::Draw, None));
        }
        None
    }

    /// History slice for a TICTACTOE_MOVE_REQUEST range.
    pub fn moves_in_range(&self, from_turn: u32, to_turn: u32) -> Vec<AppliedMove> {
        self.history
            .iter()
            .filter(|m| m.turn >= from_turn && m.turn <= to_turn)
            .copied()
            .collect()
    }

    /// Classify and (when possible) apply one inbound move.
    pub fn receive_move(
        &mut self,
        from: &str,
        turn: u32,
        position: u8,
        symbol: Symbol,
    ) -> MoveOutcome {
        if !self.players.contains_key(from) {
            return MoveOutcome::Rejected("sender is not in this game");
        }
        self.touch();

        if turn < self.turn || self.received_turns.contains(&turn) {
            return MoveOutcome::Duplicate;
        }
        if turn > self.turn {
            self.held.insert(turn, HeldMove { position, symbol });
            self.received_turns.insert(turn);
            return MoveOutcome::Held { expected: self.turn };
        }

        match self.try_apply(turn, position, symbol) {
            Ok(()) => {
                self.received_turns.insert(turn);
                self.drain_held();
                let finished = self
                    .winner()
                    .map(|(r, line)| (r.as_str().to_string(), format_line(line)));
                MoveOutcome::Applied { finished }
            }
            Err(reason) => MoveOutcome::Rejected(reason),
        }
    }

    /// Apply the local player's move. Returns the turn number consumed.
    pub fn play_local(&mut self, me: &str, position: u8) -> Result<u32, &'static str> {
        let symbol = self.symbol_of(me).ok_or("you are not in this game")?;
        if symbol != Symbol::for_turn(self.turn) {
            return Err("not your turn");
        }
        let turn = self.turn;
        self.try_apply(turn, position, symbol)?;
        self.touch();
        Ok(turn)
    }

    /// Undo a tentative local move after delivery failure.
    pub fn revert_local(&mut self, turn: u32, position: u8) {
        debug!("reverting unacknowledged move at turn {turn}");
        if self
            .history
            .last()
            .is_some_and(|m| m.turn == turn && m.position == position)
        {
            self.history.pop();
            self.board[position as usize] = None;
            self.turn = turn;
        }
    }

    fn try_apply(&mut self, turn: u32, position: u8, symbol: Symbol) -> Result<(), &'static str> {
        if position > 8 {
            return Err("position out of range");
        }
        if symbol != Symbol::for_turn(turn) {
            return Err("symbol does not own this turn");
        }
        if self.board[position as usize].is_some() {
            return Err("cell already taken");
        }
        self.board[position as usize] = Some(symbol);
        self.history.push(AppliedMove { turn, position, symbol });
        self.turn = turn + 1;
        Ok(())
    }

    /// Apply held future moves that the advancing turn counter has reached.
    fn drain_held(&mut self) {
        while let Some(held) = self.held.remove(&self.turn) {
            let turn = self.turn;
            if self.try_apply(turn, held.position, held.symbol).is_err() {
                debug!("discarding invalid held move for turn {turn}");
                break;
            }
        }
    }
}

fn format_line(line: Option<[usize; 3]>) -> String {
    match line {
        Some([a, b, c]) => format!("{a},{b},{c}"),
        None => String::new(),
    }
}

/// Process-wide map of active games, keyed by GAMEID.
pub struct GameTable {
    games: Mutex<HashMap<String, Game>>,
}

impl GameTable {
    pub fn new() -> Self {
        Self { games: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, game_id: &str, game: Game) {
        self.games.lock().unwrap().insert(game_id.to_string(), game);
    }

    pub fn contains(&self, game_id: &str) -> bool {
        self.games.lock().unwrap().contains_key(game_id)
    }

    pub fn remove(&self, game_id: &str) -> bool {
        self.games.lock().unwrap().remove(game_id).is_some()
    }

    /// Run a closure under the lock against one game. The compound
    /// lookup-and-mutate stays atomic from the caller's point of view.
    pub fn with_game<R>(&self, game_id: &str, f: impl FnOnce(&mut Game) -> R) -> Option<R> {
        self.games.lock().unwrap().get_mut(game_id).map(f)
    }

    /// Remove games idle past `max_idle_secs`, returning their ids.
    pub fn sweep_idle(&self, max_idle_secs: u64) -> Vec<String> {
        let max_idle = std::time::Duration::from_secs(max_idle_secs);
        let mut games = self.games.lock().unwrap();
        let expired: Vec<String> = games
            .iter()
            .filter(|(_, g)| g.last_activity.elapsed() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            games.remove(id);
        }
        expired
    }

    pub fn count(&self) -> usize {
        self.games.lock().unwrap().len()
    }
}

impl Default for GameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "alice@10.0.0.1:50999";
    const BOB: &str = "bob@10.0.0.2:50999";

    #[test]
    fn test_turn_ownership() {
        assert_eq!(Symbol::for_turn(1), Symbol::X);
        assert_eq!(Symbol::for_turn(2), Symbol::O);
        assert_eq!(Symbol::for_turn(5), Symbol::X);
    }

    #[test]
    fn test_apply_increments_turn_by_one() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        for (turn, pos, sym) in [(1, 0, Symbol::X), (2, 4, Symbol::O), (3, 1, Symbol::X)] {
            assert_eq!(game.turn, turn);
            let outcome = if sym == Symbol::X {
                game.receive_move(ALICE, turn, pos, sym)
            } else {
                game.receive_move(BOB, turn, pos, sym)
            };
            assert_eq!(outcome, MoveOutcome::Applied { finished: None });
            assert_eq!(game.turn, turn + 1);
        }
    }

    #[test]
    fn test_duplicate_turn_is_reacked_not_applied() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        assert!(matches!(
            game.receive_move(ALICE, 1, 0, Symbol::X),
            MoveOutcome::Applied { .. }
        ));
        assert_eq!(game.receive_move(ALICE, 1, 0, Symbol::X), MoveOutcome::Duplicate);
        // The board did not double-apply.
        assert_eq!(game.board_string(), "X........");
    }

    #[test]
    fn test_future_turn_is_held_then_drained() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        game.receive_move(ALICE, 1, 0, Symbol::X);

        // Turn 3 arrives while 2 is still missing.
        assert_eq!(
            game.receive_move(ALICE, 3, 1, Symbol::X),
            MoveOutcome::Held { expected: 2 }
        );
        assert_eq!(game.board_string(), "X........");

        // The gap fills; the held move applies right after it.
        assert_eq!(
            game.receive_move(BOB, 2, 4, Symbol::O),
            MoveOutcome::Applied { finished: None }
        );
        assert_eq!(game.board_string(), "XX..O....");
        assert_eq!(game.turn, 4);
    }

    #[test]
    fn test_wrong_symbol_for_turn_rejected() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        assert_eq!(
            game.receive_move(BOB, 1, 0, Symbol::O),
            MoveOutcome::Rejected("symbol does not own this turn")
        );
        assert_eq!(
            game.receive_move("mallory@10.0.0.9:1", 1, 0, Symbol::X),
            MoveOutcome::Rejected("sender is not in this game")
        );
    }

    #[test]
    fn test_occupied_cell_rejected() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        game.receive_move(ALICE, 1, 4, Symbol::X);
        assert_eq!(
            game.receive_move(BOB, 2, 4, Symbol::O),
            MoveOutcome::Rejected("cell already taken")
        );
    }

    #[test]
    fn test_top_row_win_detected() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        game.receive_move(ALICE, 1, 0, Symbol::X);
        game.receive_move(BOB, 2, 4, Symbol::O);
        game.receive_move(ALICE, 3, 1, Symbol::X);
        game.receive_move(BOB, 4, 5, Symbol::O);
        let outcome = game.receive_move(ALICE, 5, 2, Symbol::X);
        assert_eq!(
            outcome,
            MoveOutcome::Applied {
                finished: Some(("X".to_string(), "0,1,2".to_string()))
            }
        );
    }

    #[test]
    fn test_draw_detected() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        // X O X / X O O / O X X — full board, no line.
        let moves = [
            (1, 0, Symbol::X),
            (2, 1, Symbol::O),
            (3, 2, Symbol::X),
            (4, 4, Symbol::O),
            (5, 3, Symbol::X),
            (6, 5, Symbol::O),
            (7, 7, Symbol::X),
            (8, 6, Symbol::O),
            (9, 8, Symbol::X),
        ];
        let mut last = MoveOutcome::Duplicate;
        for (turn, pos, sym) in moves {
            let who = if sym == Symbol::X { ALICE } else { BOB };
            last = game.receive_move(who, turn, pos, sym);
        }
        assert_eq!(
            last,
            MoveOutcome::Applied {
                finished: Some(("DRAW".to_string(), String::new()))
            }
        );
    }

    #[test]
    fn test_local_play_and_revert() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        let turn = game.play_local(ALICE, 4).unwrap();
        assert_eq!(turn, 1);
        assert_eq!(game.turn, 2);
        // Bob cannot play out of turn order locally either.
        assert!(game.play_local(ALICE, 5).is_err());

        game.revert_local(turn, 4);
        assert_eq!(game.turn, 1);
        assert_eq!(game.board_string(), ".........");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut game = Game::new(ALICE, Symbol::X, BOB);
        game.receive_move(ALICE, 1, 0, Symbol::X);
        game.receive_move(BOB, 2, 4, Symbol::O);

        let rebuilt =
            Game::from_snapshot(&game.board_string(), game.turn, ALICE, Symbol::X, BOB)
                .unwrap();
        assert_eq!(rebuilt.board_string(), game.board_string());
        assert_eq!(rebuilt.turn, 3);
        assert_eq!(rebuilt.symbol_of(BOB), Some(Symbol::O));
    }

    #[test]
    fn test_sweep_removes_only_idle_games() {
        let table = GameTable::new();
        table.insert("g1", Game::new(ALICE, Symbol::X, BOB));
        assert!(table.sweep_idle(60).is_empty());
        // Zero tolerance sweeps everything that is not brand new.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(table.sweep_idle(0), vec!["g1".to_string()]);
        assert_eq!(table.count(), 0);
    }
}
