//! Winner announcement with tie handling

use crate::types::Candidate;

/// Point-in-time winner announcement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Winners {
    pub max_votes: u64,
    /// all candidates sharing `max_votes`, ascending by id
    pub candidates: Vec<Candidate>,
}

impl Winners {
    pub fn is_tie(&self) -> bool {
        self.candidates.len() > 1
    }
}

/// Winners as announced for one election
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub election_id: u64,
    pub winners: Winners,
}

/// Compute the winner(s) of `candidates`
///
/// Returns `None` for an empty roster or if nobody received a vote
pub fn resolve_winners(candidates: &[Candidate]) -> Option<Winners> {
    let max_votes = candidates.iter().map(|c| c.vote_count).max()?;
    if max_votes == 0 {
        return None;
    }

    let mut winners: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.vote_count == max_votes)
        .cloned()
        .collect();
    winners.sort_by_key(|c| c.id);

    Some(Winners {
        max_votes,
        candidates: winners,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, vote_count: u64) -> Candidate {
        Candidate {
            id,
            name: format!("candidate-{id}"),
            vote_count,
            ..Default::default()
        }
    }

    #[test]
    fn empty_roster_has_no_winner() {
        assert_eq!(resolve_winners(&[]), None);
    }

    #[test]
    fn zero_votes_has_no_winner() {
        assert_eq!(resolve_winners(&[candidate(1, 0), candidate(2, 0)]), None);
    }

    #[test]
    fn ties_are_ordered_by_id() {
        let winners =
            resolve_winners(&[candidate(2, 5), candidate(3, 2), candidate(1, 5)]).unwrap();
        assert_eq!(winners.max_votes, 5);
        assert!(winners.is_tie());
        assert_eq!(
            winners.candidates.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn single_winner() {
        let winners = resolve_winners(&[candidate(1, 1), candidate(2, 7)]).unwrap();
        assert!(!winners.is_tie());
        assert_eq!(winners.candidates[0].id, 2);
    }
}
