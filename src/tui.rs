use crossterm::{
    cursor::MoveToPreviousLine,
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use std::io;

use crate::errors::Step;

/// One line per workflow step, redrawn in place as the run advances.
pub struct WorkflowTUI {
    step_lines: Vec<StepLineState>,
    current_step_index: Option<usize>,
    header_printed: bool,
}

#[derive(Clone)]
struct StepLineState {
    step: Step,
    status: StepStatus,
    detail: String,
}

#[derive(Clone, PartialEq)]
enum StepStatus {
    Pending,     // Grey
    InProgress,  // White with activity marker
    Completed,   // Green
    Failed,      // Red
}

impl WorkflowTUI {
    pub fn new() -> Self {
        Self {
            step_lines: Step::ALL
                .iter()
                .map(|&step| StepLineState {
                    step,
                    status: StepStatus::Pending,
                    detail: String::new(),
                })
                .collect(),
            current_step_index: None,
            header_printed: false,
        }
    }

    /// Print the vendor line and every step greyed out
    pub fn show_plan(&mut self, vendor: &str, input: &str) -> io::Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::DarkGrey),
            Print(format!("📁 {} → {}\n", Self::truncate(input, 60), vendor)),
            ResetColor
        )?;
        for line in &self.step_lines {
            Self::draw_step_line(line)?;
        }
        self.header_printed = true;
        Ok(())
    }

    pub fn start_step(&mut self, step: Step) -> io::Result<()> {
        if let Some(index) = self.find_step_index(step) {
            self.step_lines[index].status = StepStatus::InProgress;
            self.current_step_index = Some(index);
            self.update_step_line(index)?;
        }
        Ok(())
    }

    /// Replace the detail text of the running step (poll attempts, counts)
    pub fn update_activity(&mut self, detail: impl Into<String>) -> io::Result<()> {
        if let Some(index) = self.current_step_index {
            if self.step_lines[index].status == StepStatus::InProgress {
                self.step_lines[index].detail = detail.into();
                self.update_step_line(index)?;
            }
        }
        Ok(())
    }

    pub fn complete_step(&mut self, step: Step, detail: impl Into<String>) -> io::Result<()> {
        self.finish_step(step, StepStatus::Completed, detail.into())
    }

    pub fn fail_step(&mut self, step: Step, reason: impl Into<String>) -> io::Result<()> {
        self.finish_step(step, StepStatus::Failed, reason.into())
    }

    pub fn show_final_summary(&mut self, output: Option<&str>) -> io::Result<()> {
        let failed = self.step_lines.iter().find(|l| l.status == StepStatus::Failed);

        execute!(io::stdout(), Print("─".repeat(80)), Print("\n"))?;
        match (failed, output) {
            (Some(line), _) => execute!(
                io::stdout(),
                SetForegroundColor(Color::Red),
                Print(format!("❌ Run stopped at step '{}'\n", line.step)),
                ResetColor
            ),
            (None, Some(path)) => execute!(
                io::stdout(),
                SetForegroundColor(Color::Green),
                Print(format!("✅ Enriched contacts written to {}\n", path)),
                ResetColor
            ),
            (None, None) => execute!(
                io::stdout(),
                SetForegroundColor(Color::Green),
                Print("✅ Run completed\n"),
                ResetColor
            ),
        }
    }

    fn finish_step(&mut self, step: Step, status: StepStatus, detail: String) -> io::Result<()> {
        if let Some(index) = self.find_step_index(step) {
            self.step_lines[index].status = status;
            self.step_lines[index].detail = detail;
            self.update_step_line(index)?;
            if Some(index) == self.current_step_index {
                self.current_step_index = None;
            }
        }
        Ok(())
    }

    fn find_step_index(&self, step: Step) -> Option<usize> {
        self.step_lines.iter().position(|l| l.step == step)
    }

    fn update_step_line(&self, index: usize) -> io::Result<()> {
        if !self.header_printed {
            return Ok(());
        }
        let lines_back = self.step_lines.len() - index;

        execute!(
            io::stdout(),
            MoveToPreviousLine(lines_back as u16),
            Clear(ClearType::CurrentLine),
        )?;

        // Redraw this line and every line below it
        for line in &self.step_lines[index..] {
            Self::draw_step_line(line)?;
        }
        Ok(())
    }

    fn draw_step_line(line: &StepLineState) -> io::Result<()> {
        let (color, icon) = match line.status {
            StepStatus::Pending => (Color::DarkGrey, "⏳"),
            StepStatus::InProgress => (Color::White, "🔄"),
            StepStatus::Completed => (Color::Green, "✅"),
            StepStatus::Failed => (Color::Red, "❌"),
        };
        let text = if line.detail.is_empty() {
            line.step.label().to_string()
        } else {
            format!("{} - {}", line.step.label(), line.detail)
        };

        execute!(
            io::stdout(),
            Clear(ClearType::CurrentLine),
            SetForegroundColor(color),
            Print(format!("  {} {}\n", icon, Self::truncate(&text, 90))),
            ResetColor
        )
    }

    fn truncate(text: &str, max: usize) -> String {
        if text.chars().count() > max {
            let head: String = text.chars().take(max - 3).collect();
            format!("{}...", head)
        } else {
            text.to_string()
        }
    }
}

impl Default for WorkflowTUI {
    fn default() -> Self {
        Self::new()
    }
}
