//! Seam over the move-legality engine. Everything chess-specific the
//! coordinator needs funnels through [`Position`]: legality, the resulting
//! position, and terminal-state classification.

use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Piece};
use thiserror::Error;

use crate::models::Color;

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("invalid move")]
    InvalidMove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawReason {
    Stalemate,
    ThreefoldRepetition,
    InsufficientMaterial,
    FiftyMoveRule,
}

impl DrawReason {
    pub fn describe(self) -> &'static str {
        match self {
            DrawReason::Stalemate => "Draw by Stalemate!",
            DrawReason::ThreefoldRepetition => "Draw by Threefold Repetition!",
            DrawReason::InsufficientMaterial => "Draw by Insufficient Material!",
            DrawReason::FiftyMoveRule => "Draw by 50-move rule!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// The side that just moved delivered mate.
    Checkmate,
    Draw(DrawReason),
}

/// Result of a legal move applied to a position.
#[derive(Debug, Clone)]
pub struct AppliedMove {
    pub notation: String,
    pub fen_after: String,
    pub turn_after: Color,
    pub move_number: i64,
    pub position_hash: u64,
}

/// A full position: board plus the halfmove/fullmove counters the board
/// representation itself does not carry.
#[derive(Debug, Clone)]
pub struct Position {
    board: Board,
    halfmove: u32,
    fullmove: u32,
}

impl Position {
    pub fn start() -> Self {
        Self {
            board: Board::default(),
            halfmove: 0,
            fullmove: 1,
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self, RulesError> {
        let board =
            Board::from_str(fen).map_err(|_| RulesError::InvalidPosition(fen.to_string()))?;
        let mut tail = fen.split_whitespace().skip(4);
        let halfmove = tail.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let fullmove = tail.next().and_then(|f| f.parse().ok()).unwrap_or(1);
        Ok(Self {
            board,
            halfmove,
            fullmove,
        })
    }

    /// Renders the full six-field FEN.
    pub fn fen(&self) -> String {
        let rendered = self.board.to_string();
        let fields: Vec<&str> = rendered.split_whitespace().take(4).collect();
        format!("{} {} {}", fields.join(" "), self.halfmove, self.fullmove)
    }

    pub fn side_to_move(&self) -> Color {
        match self.board.side_to_move() {
            chess::Color::White => Color::White,
            chess::Color::Black => Color::Black,
        }
    }

    pub fn hash(&self) -> u64 {
        self.board.get_hash()
    }

    pub fn fullmove(&self) -> i64 {
        self.fullmove as i64
    }

    /// Validates and applies a candidate move given in SAN ("Nf3") or
    /// coordinate ("g1f3", "e7e8q") notation.
    pub fn apply(&mut self, input: &str) -> Result<AppliedMove, RulesError> {
        let input = input.trim();
        let mv = self.parse(input)?;
        if !self.board.legal(mv) {
            return Err(RulesError::InvalidMove);
        }

        let mover = self.board.side_to_move();
        let is_pawn = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn);
        let is_capture = self.board.piece_on(mv.get_dest()).is_some();
        let move_number = self.fullmove as i64;

        self.board = self.board.make_move_new(mv);
        if is_pawn || is_capture {
            self.halfmove = 0;
        } else {
            self.halfmove += 1;
        }
        if mover == chess::Color::Black {
            self.fullmove += 1;
        }

        Ok(AppliedMove {
            notation: input.to_string(),
            fen_after: self.fen(),
            turn_after: self.side_to_move(),
            move_number,
            position_hash: self.board.get_hash(),
        })
    }

    fn parse(&self, input: &str) -> Result<ChessMove, RulesError> {
        ChessMove::from_san(&self.board, input)
            .or_else(|_| ChessMove::from_str(input))
            .map_err(|_| RulesError::InvalidMove)
    }

    /// Terminal classification of the current position. Threefold
    /// repetition depends on history the position alone cannot see, so the
    /// caller reports whether the position has now occurred three times.
    pub fn terminal(&self, threefold: bool) -> Option<TerminalState> {
        match self.board.status() {
            BoardStatus::Checkmate => Some(TerminalState::Checkmate),
            BoardStatus::Stalemate => Some(TerminalState::Draw(DrawReason::Stalemate)),
            BoardStatus::Ongoing => {
                if insufficient_material(&self.board) {
                    Some(TerminalState::Draw(DrawReason::InsufficientMaterial))
                } else if self.halfmove >= 100 {
                    Some(TerminalState::Draw(DrawReason::FiftyMoveRule))
                } else if threefold {
                    Some(TerminalState::Draw(DrawReason::ThreefoldRepetition))
                } else {
                    None
                }
            }
        }
    }
}

/// Bare kings, or a lone minor piece against a bare king.
fn insufficient_material(board: &Board) -> bool {
    match board.combined().popcnt() {
        2 => true,
        3 => {
            (*board.pieces(Piece::Bishop) | *board.pieces(Piece::Knight)).popcnt() == 1
        }
        _ => false,
    }
}
