//! Keyboard input and key bindings.

use std::collections::{HashMap, HashSet};

pub use winit::keyboard::KeyCode;

/// Something the demo loop can be asked to do from the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ReloadScene,
    ClearScene,
    Exit,
}

/// Tracks held keys and turns fresh presses into [`Action`]s.
#[derive(Debug)]
pub struct InputState {
    pressed_keys: HashSet<KeyCode>,
    /// Presses since the last `take_actions`, in arrival order
    pending: Vec<Action>,
    bindings: HashMap<KeyCode, Action>,
}

impl Default for InputState {
    fn default() -> Self {
        Self::new()
    }
}

impl InputState {
    /// Creates an input state with the default bindings: `R` reloads the
    /// scene, `C` clears it and `Escape` exits.
    pub fn new() -> Self {
        let bindings = HashMap::from([
            (KeyCode::KeyR, Action::ReloadScene),
            (KeyCode::KeyC, Action::ClearScene),
            (KeyCode::Escape, Action::Exit),
        ]);
        Self {
            pressed_keys: HashSet::new(),
            pending: Vec::new(),
            bindings,
        }
    }

    /// Binds `key` to `action`, replacing any previous binding of `key`.
    pub fn bind(&mut self, key: KeyCode, action: Action) {
        self.bindings.insert(key, action);
    }

    pub fn on_key_pressed(&mut self, key: KeyCode) {
        // Key repeat reports presses for a key that is already down
        if self.pressed_keys.insert(key)
            && let Some(&action) = self.bindings.get(&key)
        {
            self.pending.push(action);
        }
    }

    pub fn on_key_released(&mut self, key: KeyCode) {
        self.pressed_keys.remove(&key);
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.pressed_keys.contains(&key)
    }

    /// Drains the actions triggered since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending)
    }

    /// Forgets held keys, e.g. when the window loses focus.
    pub fn clear(&mut self) {
        self.pressed_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bindings() {
        let mut input = InputState::new();
        input.on_key_pressed(KeyCode::KeyR);
        input.on_key_pressed(KeyCode::KeyC);
        input.on_key_pressed(KeyCode::KeyW);
        assert_eq!(
            input.take_actions(),
            vec![Action::ReloadScene, Action::ClearScene]
        );
        assert!(input.take_actions().is_empty());
    }

    #[test]
    fn test_held_key_triggers_once() {
        let mut input = InputState::new();
        input.on_key_pressed(KeyCode::KeyR);
        input.on_key_pressed(KeyCode::KeyR);
        assert_eq!(input.take_actions(), vec![Action::ReloadScene]);
        assert!(input.is_key_pressed(KeyCode::KeyR));

        input.on_key_released(KeyCode::KeyR);
        assert!(!input.is_key_pressed(KeyCode::KeyR));
        input.on_key_pressed(KeyCode::KeyR);
        assert_eq!(input.take_actions(), vec![Action::ReloadScene]);
    }

    #[test]
    fn test_rebind() {
        let mut input = InputState::new();
        input.bind(KeyCode::KeyQ, Action::Exit);
        input.on_key_pressed(KeyCode::KeyQ);
        assert_eq!(input.take_actions(), vec![Action::Exit]);
    }

    #[test]
    fn test_clear_releases_keys() {
        let mut input = InputState::new();
        input.on_key_pressed(KeyCode::Escape);
        input.clear();
        assert!(!input.is_key_pressed(KeyCode::Escape));
        assert_eq!(input.take_actions(), vec![Action::Exit]);
    }
}
