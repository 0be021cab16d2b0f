//! Key Event Log (KEL) - the ordered, signed history of one identifier.

use crate::event::{Ilk, Seal, SignedEvent};
use crate::keys::key_digest;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Current state of an identifier, derived by replaying its KEL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyState {
    pub prefix: String,
    /// Sequence number of the latest event.
    pub sn: u64,
    /// SAID of the latest event.
    pub said: String,
    pub keys: Vec<String>,
    pub threshold: u32,
    pub next_digests: Vec<String>,
    pub next_threshold: u32,
    /// Sequence number of the latest establishment event.
    pub establishment_sn: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegator: Option<String>,
}

/// A key event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kel(Vec<SignedEvent>);

impl Kel {
    /// Wrap events without verifying them (sorted by sequence number).
    pub fn from_events(mut events: Vec<SignedEvent>) -> Self {
        events.sort_by_key(|e| e.event.sn);
        Self(events)
    }

    /// Wrap and fully verify events.
    pub fn verified(events: Vec<SignedEvent>) -> Result<(Self, KeyState)> {
        let kel = Self::from_events(events);
        let state = kel.verify()?;
        Ok((kel, state))
    }

    pub fn events(&self) -> &[SignedEvent] {
        &self.0
    }

    pub fn inception(&self) -> Option<&SignedEvent> {
        self.0.first()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.inception().map(|e| e.event.prefix.as_str())
    }

    pub fn delegator(&self) -> Option<&str> {
        self.inception()
            .and_then(|e| e.event.delegator.as_deref())
    }

    pub fn last_event(&self) -> Option<&SignedEvent> {
        self.0.last()
    }

    pub fn last_establishment_event(&self) -> Option<&SignedEvent> {
        self.0.iter().rev().find(|e| e.event.is_establishment())
    }

    /// The interaction event anchoring `seal`, if any.
    pub fn find_anchor(&self, seal: &Seal) -> Option<&SignedEvent> {
        self.0
            .iter()
            .find(|e| e.event.is_interaction() && e.event.anchors.contains(seal))
    }

    pub fn contains_anchor(&self, seal: &Seal) -> bool {
        self.find_anchor(seal).is_some()
    }

    /// Append an event after verifying it against the current state.
    pub fn append(&mut self, event: SignedEvent) -> Result<KeyState> {
        let state = self.verify()?;
        let next = apply(Some(&state), &event)?;
        self.0.push(event);
        Ok(next)
    }

    /// Replay the log, checking chaining, SAIDs, pre-rotation and signatures.
    pub fn verify(&self) -> Result<KeyState> {
        let mut state: Option<KeyState> = None;
        for event in &self.0 {
            state = Some(apply(state.as_ref(), event)?);
        }
        state.ok_or_else(|| Error::InvalidEvent("empty key event log".into()))
    }
}

/// Apply one event to the state produced by its predecessors.
fn apply(state: Option<&KeyState>, signed: &SignedEvent) -> Result<KeyState> {
    let event = &signed.event;
    event.verify_said()?;

    match (state, event.ilk) {
        (None, Ilk::Icp | Ilk::Dip) => {
            if event.sn != 0 {
                return Err(Error::InvalidEvent(format!(
                    "inception must have sn 0, got {}",
                    event.sn
                )));
            }
            if event.ilk == Ilk::Dip && event.delegator.is_none() {
                return Err(Error::InvalidEvent("delegated inception without delegator".into()));
            }
            let threshold = event.threshold.unwrap_or(1);
            signed.verify_signatures(&event.keys, threshold)?;
            Ok(KeyState {
                prefix: event.prefix.clone(),
                sn: 0,
                said: event.said.clone(),
                keys: event.keys.clone(),
                threshold,
                next_digests: event.next_digests.clone(),
                next_threshold: event.next_threshold.unwrap_or(1),
                establishment_sn: 0,
                delegator: event.delegator.clone(),
            })
        }
        (None, ilk) => Err(Error::InvalidEvent(format!(
            "log must start with an inception, found {ilk:?}"
        ))),
        (Some(_), Ilk::Icp | Ilk::Dip) => Err(Error::InvalidEvent(format!(
            "second inception at sn {}",
            event.sn
        ))),
        (Some(state), ilk) => {
            check_chain(state, signed)?;
            let mut next = state.clone();
            next.sn = event.sn;
            next.said = event.said.clone();

            if ilk == Ilk::Rot {
                let revealed = event.keys.iter().map(|k| key_digest(k));
                for digest in revealed {
                    if !state.next_digests.contains(&digest) {
                        return Err(Error::InvalidEvent(format!(
                            "rotation at sn {} reveals an uncommitted key",
                            event.sn
                        )));
                    }
                }
                next.keys = event.keys.clone();
                next.threshold = event.threshold.unwrap_or(1);
                next.next_digests = event.next_digests.clone();
                next.next_threshold = event.next_threshold.unwrap_or(1);
                next.establishment_sn = event.sn;
            }

            signed.verify_signatures(&next.keys, next.threshold)?;
            Ok(next)
        }
    }
}

fn check_chain(state: &KeyState, signed: &SignedEvent) -> Result<()> {
    let event = &signed.event;
    if event.prefix != state.prefix {
        return Err(Error::InvalidEvent(format!(
            "event for {} in log of {}",
            event.prefix, state.prefix
        )));
    }
    if event.sn != state.sn + 1 {
        return Err(Error::InvalidEvent(format!(
            "expected sn {}, got {}",
            state.sn + 1,
            event.sn
        )));
    }
    if event.prior.as_deref() != Some(state.said.as_str()) {
        return Err(Error::InvalidEvent(format!(
            "event at sn {} does not chain to {}",
            event.sn, state.said
        )));
    }
    Ok(())
}

impl Deref for Kel {
    type Target = Vec<SignedEvent>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for Kel {
    type Item = SignedEvent;
    type IntoIter = std::vec::IntoIter<SignedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KeyEvent;
    use crate::keys::Signer;

    fn incept() -> (Kel, Signer, Signer) {
        let (current, next) = (Signer::generate(), Signer::generate());
        let icp = KeyEvent::inception(&[&current], &[&next]).unwrap();
        let signed = SignedEvent::sign(icp, &[&current]).unwrap();
        (Kel::from_events(vec![signed]), current, next)
    }

    #[test]
    fn test_incept() {
        let (kel, current, _) = incept();
        let state = kel.verify().unwrap();
        assert_eq!(state.sn, 0);
        assert_eq!(state.keys, vec![current.public_key()]);
        assert_eq!(Some(state.prefix.as_str()), kel.prefix());
    }

    #[test]
    fn test_interact_and_find_anchor() {
        let (mut kel, current, _) = incept();
        let anchored = KeyEvent::inception(&[&Signer::generate()], &[]).unwrap().seal();

        let last = kel.last_event().unwrap().event.clone();
        let ixn = KeyEvent::interaction(&last, vec![anchored.clone()]).unwrap();
        let state = kel.append(SignedEvent::sign(ixn, &[&current]).unwrap()).unwrap();

        assert_eq!(state.sn, 1);
        assert_eq!(kel.find_anchor(&anchored).unwrap().event.sn, 1);
    }

    #[test]
    fn test_interact_with_wrong_key_fails() {
        let (mut kel, _, _) = incept();
        let last = kel.last_event().unwrap().event.clone();
        let ixn = KeyEvent::interaction(&last, Vec::new()).unwrap();
        let result = kel.append(SignedEvent::sign(ixn, &[&Signer::generate()]).unwrap());
        assert!(matches!(result, Err(Error::SignatureMismatch { sn: 1, .. })));
    }

    #[test]
    fn test_rotate() {
        let (mut kel, _, next) = incept();
        let after = Signer::generate();
        let last = kel.last_event().unwrap().event.clone();
        let rot = KeyEvent::rotation(&last, &[&next], &[&after]).unwrap();
        let state = kel.append(SignedEvent::sign(rot, &[&next]).unwrap()).unwrap();

        assert_eq!(state.keys, vec![next.public_key()]);
        assert_eq!(state.establishment_sn, 1);
    }

    #[test]
    fn test_rotate_to_uncommitted_key_fails() {
        let (mut kel, _, _) = incept();
        let rogue = Signer::generate();
        let last = kel.last_event().unwrap().event.clone();
        let rot = KeyEvent::rotation(&last, &[&rogue], &[&Signer::generate()]).unwrap();
        assert!(kel.append(SignedEvent::sign(rot, &[&rogue]).unwrap()).is_err());
    }

    #[test]
    fn test_interaction_before_inception_fails() {
        let (kel, current, _) = incept();
        let last = kel.last_event().unwrap().event.clone();
        let ixn = KeyEvent::interaction(&last, Vec::new()).unwrap();
        let orphan = Kel::from_events(vec![SignedEvent::sign(ixn, &[&current]).unwrap()]);
        assert!(orphan.verify().is_err());
    }

    #[test]
    fn test_repeated_index_does_not_meet_threshold() {
        let keys = [Signer::generate(), Signer::generate(), Signer::generate()];
        let icp = KeyEvent::inception(&[&keys[0], &keys[1], &keys[2]], &[&Signer::generate()])
            .unwrap();
        assert_eq!(icp.threshold, Some(2));

        let mut signed = SignedEvent::sign(icp.clone(), &[&keys[0]]).unwrap();
        let repeated = signed.signatures[0].clone();
        signed.signatures.push(repeated);
        assert!(matches!(
            Kel::from_events(vec![signed]).verify(),
            Err(Error::SignatureMismatch { sn: 0, .. })
        ));

        let lone = SignedEvent::sign(icp.clone(), &[&keys[0]]).unwrap();
        assert!(Kel::from_events(vec![lone]).verify().is_err());

        let pair = SignedEvent::sign(icp, &[&keys[0], &keys[1]]).unwrap();
        assert_eq!(Kel::from_events(vec![pair]).verify().unwrap().threshold, 2);
    }

    #[test]
    fn test_empty_kel_fails() {
        assert!(Kel::default().verify().is_err());
    }
}
