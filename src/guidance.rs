//! Classifier-free guidance stream.
//!
//! The guidance context is fed the negative prompt in place of the real
//! prompt, then mirrors every later token so that both contexts stay aligned
//! at the tail. `offset` is how much longer the negative prompt is.

use crate::backend::{Backend, BackendError, Token};
use crate::batch::DecodeError;
use crate::state::SessionState;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GuidanceStream {
    guidance_inp: Vec<Token>,
    original_prompt_len: usize,
    offset: i32,
}

impl GuidanceStream {
    pub fn new(guidance_inp: Vec<Token>, original_prompt_len: usize) -> Self {
        let offset = guidance_inp.len() as i32 - original_prompt_len as i32;
        Self {
            guidance_inp,
            original_prompt_len,
            offset,
        }
    }

    /// Tokenize the negative and the real prompt the same way.
    pub fn from_prompts<B: Backend + ?Sized>(
        backend: &B,
        negative_prompt: &str,
        prompt: &str,
        add_bos: bool,
    ) -> Result<Self, BackendError> {
        let guidance_inp = backend.tokenize(negative_prompt, add_bos, true)?;
        let original_prompt_len = backend.tokenize(prompt, add_bos, true)?.len();
        debug!(
            n_guidance = guidance_inp.len(),
            original_prompt_len, "guidance prompt"
        );
        Ok(Self::new(guidance_inp, original_prompt_len))
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn guidance_inp(&self) -> &[Token] {
        &self.guidance_inp
    }

    pub fn original_prompt_len(&self) -> usize {
        self.original_prompt_len
    }

    /// Whether the negative prompt still has to be fed to the guidance context.
    fn needs_prompt(&self, n_past_guidance: i32) -> bool {
        n_past_guidance < self.guidance_inp.len() as i32
    }

    /// The buffer to feed next: the negative prompt followed by whatever in
    /// `embd` lies past the original prompt, or `embd` itself once the
    /// negative prompt is resident.
    pub fn build_input(&self, n_past_guidance: i32, embd: &[Token]) -> Vec<Token> {
        if self.needs_prompt(n_past_guidance) {
            let mut buf = self.guidance_inp.clone();
            if embd.len() > self.original_prompt_len {
                buf.extend_from_slice(&embd[self.original_prompt_len..]);
            }
            buf
        } else {
            embd.to_vec()
        }
    }

    /// Feed the guidance context for the current step.
    ///
    /// Sets `state.guidance_ready` to whether the guidance logits can be
    /// used for the next sample.
    pub fn step<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        state: &mut SessionState,
        n_batch: usize,
    ) -> Result<(), DecodeError> {
        let result = if self.needs_prompt(state.n_past_guidance()) {
            state.embd_guidance = self.build_input(state.n_past_guidance(), &state.embd);
            state.guidance.feed(backend, &state.embd_guidance, n_batch)
        } else {
            state.guidance.feed(backend, &state.embd, n_batch)
        };
        state.guidance_ready = result.is_ok();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;
    use crate::backend::StreamKind;

    #[test]
    fn offset_is_length_difference() {
        let backend = ScriptedBackend::new(64)
            .with_tokens("neg", &[1, 2, 3, 4, 5])
            .with_tokens("pos", &[7, 8, 9]);
        let g = GuidanceStream::from_prompts(&backend, "neg", "pos", false).unwrap();
        assert_eq!(g.offset(), 2);
        assert_eq!(g.original_prompt_len(), 3);
    }

    #[test]
    fn negative_prompt_replaces_the_real_one() {
        let g = GuidanceStream::new(vec![1, 2, 3, 4, 5], 3);
        assert_eq!(g.build_input(0, &[7, 8, 9, 10, 11]), vec![1, 2, 3, 4, 5, 10, 11]);
        assert_eq!(g.build_input(0, &[7, 8]), vec![1, 2, 3, 4, 5]);
        assert_eq!(g.build_input(5, &[12]), vec![12]);
    }

    #[test]
    fn step_feeds_prompt_then_mirrors() {
        let mut backend = ScriptedBackend::new(64).with_guidance();
        let g = GuidanceStream::new(vec![1, 2, 3, 4, 5], 3);
        let mut state = SessionState::new(-1);

        state.embd = vec![7, 8, 9];
        g.step(&mut backend, &mut state, 512).unwrap();
        assert!(state.guidance_ready);
        assert_eq!(state.n_past_guidance(), 5);
        assert_eq!(state.embd_guidance, vec![1, 2, 3, 4, 5]);

        state.embd = vec![42];
        g.step(&mut backend, &mut state, 512).unwrap();
        assert_eq!(state.n_past_guidance(), 6);
        assert_eq!(backend.decoded(StreamKind::Guidance), vec![1, 2, 3, 4, 5, 42]);
    }

    #[test]
    fn failed_step_marks_guidance_unusable() {
        let mut backend = ScriptedBackend::new(64).with_guidance();
        backend.fail_decodes(StreamKind::Guidance, 1);
        let g = GuidanceStream::new(vec![1, 2], 1);
        let mut state = SessionState::new(-1);
        state.guidance_ready = true;
        state.embd = vec![7];

        assert!(g.step(&mut backend, &mut state, 512).is_err());
        assert!(!state.guidance_ready);
        assert_eq!(state.n_past_guidance(), 0);
    }
}
