use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::path::{Path, PathBuf};

use crate::config::{Config, Profile, SoundCandidate, SoundSpec, DEFAULT_PROFILE};
use crate::event::Event;
use crate::values::Volume;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ProfileHints {
    pub(crate) restoring: Option<String>,
    pub(crate) persisted: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Resolved {
    pub(crate) profile: String,
    pub(crate) sound: PathBuf,
    pub(crate) volume: Volume,
}

pub(crate) fn select_profile<'a>(
    config: &'a Config,
    event: &Event,
    hints: &ProfileHints,
) -> Option<(&'a str, &'a Profile)> {
    [
        event.profile.as_deref(),
        hints.restoring.as_deref(),
        hints.persisted.as_deref(),
        Some(config.active_profile.as_str()),
        Some(DEFAULT_PROFILE),
    ]
    .into_iter()
    .flatten()
    .find_map(|name| config.profiles.get_key_value(name))
    .map(|(name, profile)| (name.as_str(), profile))
}

pub(crate) fn resolve<R: Rng>(
    config: &Config,
    event: &Event,
    hints: &ProfileHints,
    rng: &mut R,
) -> Result<Resolved, String> {
    let (name, profile) = select_profile(config, event, hints)
        .ok_or_else(|| "no matching profile configured".to_string())?;
    let spec = profile
        .sounds
        .get(&event.kind)
        .ok_or_else(|| format!("profile {} has no sound for {}", name, event.kind))?;
    let reference = match spec {
        SoundSpec::One(path) => path.as_str(),
        SoundSpec::Many(candidates) => pick_candidate(candidates, rng)
            .map(SoundCandidate::path)
            .ok_or_else(|| format!("profile {} has an empty sound list for {}", name, event.kind))?,
    };
    Ok(Resolved {
        profile: name.to_string(),
        sound: sound_path(reference, profile, config.base_dir.as_deref()),
        volume: resolve_volume(config, Some(profile), event),
    })
}

pub(crate) fn pick_candidate<'a, R: Rng>(
    candidates: &'a [SoundCandidate],
    rng: &mut R,
) -> Option<&'a SoundCandidate> {
    if candidates.is_empty() {
        return None;
    }
    let mut weights: Vec<f64> = candidates
        .iter()
        .map(|candidate| {
            let weight = candidate.weight();
            if weight.is_finite() && weight > 0.0 {
                weight
            } else {
                0.0
            }
        })
        .collect();
    // Finite weights can still sum to infinity; scale so the largest is 1.
    let largest = weights.iter().copied().fold(0.0_f64, f64::max);
    if largest > 0.0 {
        for weight in &mut weights {
            *weight /= largest;
        }
    }
    match WeightedIndex::new(&weights) {
        Ok(index) => candidates.get(index.sample(rng)),
        Err(_) => candidates.get(rng.gen_range(0..candidates.len())),
    }
}

pub(crate) fn resolve_volume(config: &Config, profile: Option<&Profile>, event: &Event) -> Volume {
    event
        .volume
        .or_else(|| config.event(event.kind).and_then(|e| e.volume))
        .or_else(|| profile.and_then(|p| p.volume))
        .unwrap_or(config.volume)
}

fn sound_path(reference: &str, profile: &Profile, base_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(reference);
    if path.is_absolute() {
        return path;
    }
    match profile.sound_dir.as_deref().or(base_dir) {
        Some(dir) => dir.join(path),
        None => path,
    }
}
